use common::models::CredentialCipher;

/// Credential boundary for this deployment: rows hold the values as
/// provisioned, so revealing them is the identity. Swapping in a real
/// cipher only touches this type.
pub struct PlainCipher;

impl CredentialCipher for PlainCipher {
    fn decrypt(&self, value: &str) -> anyhow::Result<String> {
        Ok(value.to_string())
    }
}
