//! Module: crypto
//! Responsibility: the encrypt/decrypt capability the transport adapter
//! uses to open encrypted fields before rows enter the pipeline.
//! Does not own: key wrapping, key caches, or key rotation; those stay
//! behind `PayloadCipher`.

use crate::{
    error::InternalError,
    fetch::{FetchError, FetchErrorKind, FetchRequest, FetchResponse, PartitionFetcher},
    row::Row,
    serialize::{deserialize_bounded, serialize},
    value::Value,
};
use async_trait::async_trait;
use thiserror::Error as ThisError;

// Largest plaintext field accepted after decryption.
const MAX_PLAINTEXT_BYTES: usize = 2 * 1024 * 1024;

///
/// KeyMetadata
///
/// Names the data-encryption key and algorithm a field was sealed with.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyMetadata {
    pub key_id: String,
    pub algorithm: String,
}

///
/// CryptoError
///

#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
pub enum CryptoError {
    #[error("encryption key {key_id} is unavailable")]
    KeyUnavailable { key_id: String },

    #[error("field {field} is not ciphertext")]
    NotCiphertext { field: String },

    #[error("cipher failure: {0}")]
    Cipher(String),

    #[error("decrypted field {field} is not a value: {reason}")]
    Plaintext { field: String, reason: String },

    #[error(transparent)]
    Internal(#[from] InternalError),
}

///
/// PayloadCipher
///
/// Opaque key-management capability supplied by the embedding client.
///

#[async_trait]
pub trait PayloadCipher: Send + Sync {
    fn supports(&self, algorithm: &str) -> bool;

    async fn encrypt(&self, plaintext: &[u8], key: &KeyMetadata) -> Result<Vec<u8>, CryptoError>;

    async fn decrypt(&self, ciphertext: &[u8], key: &KeyMetadata) -> Result<Vec<u8>, CryptoError>;
}

///
/// EncryptedField
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EncryptedField {
    pub field: String,
    pub key: KeyMetadata,
}

/// Seal one value for storage in an encrypted field.
pub async fn seal_value(
    cipher: &dyn PayloadCipher,
    value: &Value,
    key: &KeyMetadata,
) -> Result<Value, CryptoError> {
    ensure_supported(cipher, key)?;
    let plaintext = serialize(value).map_err(InternalError::from)?;

    Ok(Value::Bytes(cipher.encrypt(&plaintext, key).await?))
}

fn ensure_supported(cipher: &dyn PayloadCipher, key: &KeyMetadata) -> Result<(), CryptoError> {
    if cipher.supports(&key.algorithm) {
        return Ok(());
    }

    Err(InternalError::crypto_unsupported(format!(
        "algorithm {} for key {} is not supported by the configured cipher",
        key.algorithm, key.key_id
    ))
    .into())
}

///
/// DecryptingFetcher
///
/// Transport adapter: forwards requests to `inner` and opens the configured
/// encrypted fields of every returned row. A field that cannot be opened
/// fails the fetch as malformed.
///

pub struct DecryptingFetcher<F, C> {
    inner: F,
    cipher: C,
    fields: Vec<EncryptedField>,
}

impl<F, C> DecryptingFetcher<F, C>
where
    F: PartitionFetcher,
    C: PayloadCipher,
{
    pub const fn new(inner: F, cipher: C, fields: Vec<EncryptedField>) -> Self {
        Self {
            inner,
            cipher,
            fields,
        }
    }

    async fn open_row(&self, row: &mut Row) -> Result<(), CryptoError> {
        for EncryptedField { field, key } in &self.fields {
            let ciphertext = match row.fields.get(field) {
                None | Some(Value::Null) => continue,
                Some(Value::Bytes(bytes)) => bytes,
                Some(_) => {
                    return Err(CryptoError::NotCiphertext {
                        field: field.clone(),
                    });
                }
            };

            ensure_supported(&self.cipher, key)?;
            let plaintext = self.cipher.decrypt(ciphertext, key).await?;
            let value: Value = deserialize_bounded(&plaintext, MAX_PLAINTEXT_BYTES).map_err(
                |err| CryptoError::Plaintext {
                    field: field.clone(),
                    reason: err.to_string(),
                },
            )?;
            row.fields.insert(field.clone(), value);
        }

        Ok(())
    }
}

#[async_trait]
impl<F, C> PartitionFetcher for DecryptingFetcher<F, C>
where
    F: PartitionFetcher,
    C: PayloadCipher,
{
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let partition = request.partition.clone();
        let mut response = self.inner.fetch(request).await?;

        for row in &mut response.rows {
            if let Err(err) = self.open_row(row).await {
                tracing::warn!(
                    partition = %partition,
                    row = %row.id,
                    error = %err,
                    "field decryption failed"
                );
                return Err(FetchError::new(
                    FetchErrorKind::Malformed,
                    format!("row {}: {err}", row.id),
                ));
            }
        }

        Ok(response)
    }
}

///
/// TESTS
///
