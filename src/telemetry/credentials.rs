//! Signature credentials for the pub/sub broker

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha1::Sha1;

use crate::{Error, Result};

type HmacSha1 = Hmac<Sha1>;

/// Client id, username and password for one connection
#[derive(Debug, Clone)]
pub struct MqttCredentials {
    pub client_id: String,
    pub username: String,
    pub password: SecretString,
}

impl MqttCredentials {
    /// Derive credentials from the instance's access and secret keys
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the secret key cannot key the MAC
    pub fn sign(
        group_id: &str,
        device_id: &str,
        instance_id: &str,
        access_key: &str,
        secret_key: &SecretString,
    ) -> Result<Self> {
        let client_id = client_id(group_id, device_id);
        let password = signature(secret_key, &client_id)?;
        Ok(Self {
            username: format!("Signature|{access_key}|{instance_id}"),
            password: SecretString::from(password),
            client_id,
        })
    }
}

/// Cloud-side client id for a device
#[must_use]
pub fn client_id(group_id: &str, device_id: &str) -> String {
    format!("{group_id}@@@{device_id}_cloud")
}

/// `base64(HMAC-SHA1(secret_key, client_id))`
///
/// # Errors
///
/// Returns a configuration error if the key is rejected
pub fn signature(secret_key: &SecretString, client_id: &str) -> Result<String> {
    let mut mac = HmacSha1::new_from_slice(secret_key.expose_secret().as_bytes())
        .map_err(|e| Error::Config(format!("invalid mqtt secret key: {e}")))?;
    mac.update(client_id.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}
