//! Credential file import
//!
//! Previously exported device credentials come in three shapes: plain JSON,
//! a JSON object holding base64 `salt`/`iv`/`ciphertext`, or raw bytes
//! `salt[16] || iv[16] || ciphertext`. The encrypted forms use AES-256-CBC
//! with a PBKDF2-HMAC-SHA256 key.

use aes::Aes256;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use maprelay_core::{Error, RegistrationBundle, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, info};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Default PBKDF2 iteration count
pub const DEFAULT_KDF_ITERATIONS: u32 = 1000;

const SALT_LEN: usize = 16;
const IV_LEN: usize = 16;
const KEY_LEN: usize = 32;
const SALT_MARKER: u8 = b'$';
const SALT_HEADER_LEN: usize = 4;
const MIN_KDF_ITERATIONS: u32 = 1000;
const MAX_KDF_ITERATIONS: u32 = 65535;

/// Dict form of an encrypted credential file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedDict {
    pub salt: String,
    pub iv: String,
    pub ciphertext: String,
    #[serde(default)]
    pub info: String,
}

/// Decode a credential file into a registration bundle
///
/// A password is only needed for the encrypted forms.
pub fn import_credentials(data: &[u8], password: Option<&str>) -> Result<RegistrationBundle> {
    let plaintext = match std::str::from_utf8(data) {
        Ok(text) => {
            let value: serde_json::Value = serde_json::from_str(text)
                .map_err(|e| Error::invalid_credential_file(format!("not JSON: {}", e)))?;

            if value.get("ciphertext").is_some() {
                debug!("Importing dict-encrypted credential file");
                let dict: EncryptedDict = serde_json::from_value(value).map_err(|e| {
                    Error::invalid_credential_file(format!("bad encrypted file: {}", e))
                })?;
                cipher(password)?.decrypt_dict(&dict)?
            } else {
                text.to_string()
            }
        }
        Err(_) => {
            debug!("Importing byte-encrypted credential file");
            cipher(password)?.decrypt_bytes(data)?
        }
    };

    let bundle: RegistrationBundle = serde_json::from_str(&plaintext)
        .map_err(|e| Error::invalid_credential_file(format!("bad credentials: {}", e)))?;

    info!("Imported credentials for {}", bundle.device_name());
    Ok(bundle)
}

fn cipher(password: Option<&str>) -> Result<CredentialCipher> {
    password
        .filter(|p| !p.is_empty())
        .map(CredentialCipher::new)
        .ok_or_else(|| Error::invalid_credential_file("file is encrypted, password required"))
}

/// Password-based cipher for credential files
pub struct CredentialCipher {
    password: String,
    kdf_iterations: u32,
}

impl CredentialCipher {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
        }
    }

    /// Builder pattern: set the iteration count used when encrypting
    pub fn with_kdf_iterations(mut self, iterations: u32) -> Result<Self> {
        check_iterations(iterations)?;
        self.kdf_iterations = iterations;
        Ok(self)
    }

    /// Encrypt into the dict form
    pub fn encrypt_to_dict(&self, plaintext: &str) -> Result<EncryptedDict> {
        let (salt, iv, ciphertext) = self.encrypt(plaintext.as_bytes())?;
        Ok(EncryptedDict {
            salt: BASE64.encode(salt),
            iv: BASE64.encode(iv),
            ciphertext: BASE64.encode(ciphertext),
            info: "base64-encoded AES-CBC-256 of JSON object".to_string(),
        })
    }

    pub fn decrypt_dict(&self, dict: &EncryptedDict) -> Result<String> {
        let salt = decode_b64("salt", &dict.salt)?;
        let iv = decode_b64("iv", &dict.iv)?;
        let ciphertext = decode_b64("ciphertext", &dict.ciphertext)?;
        self.decrypt(&salt, &iv, &ciphertext)
    }

    /// Encrypt into the byte form
    pub fn encrypt_to_bytes(&self, plaintext: &str) -> Result<Vec<u8>> {
        let (salt, iv, ciphertext) = self.encrypt(plaintext.as_bytes())?;
        let mut out = Vec::with_capacity(SALT_LEN + IV_LEN + ciphertext.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt_bytes(&self, data: &[u8]) -> Result<String> {
        if data.len() <= SALT_LEN + IV_LEN {
            return Err(Error::invalid_credential_file("encrypted file too short"));
        }
        let (salt, rest) = data.split_at(SALT_LEN);
        let (iv, ciphertext) = rest.split_at(IV_LEN);
        self.decrypt(salt, iv, ciphertext)
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<([u8; SALT_LEN], [u8; IV_LEN], Vec<u8>)> {
        let mut rng = rand::thread_rng();

        let mut salt = [0u8; SALT_LEN];
        salt[0] = SALT_MARKER;
        salt[1..3].copy_from_slice(&(self.kdf_iterations as u16).to_be_bytes());
        salt[3] = SALT_MARKER;
        rng.fill_bytes(&mut salt[SALT_HEADER_LEN..]);

        let mut iv = [0u8; IV_LEN];
        rng.fill_bytes(&mut iv);

        let key = self.derive_key(&salt[SALT_HEADER_LEN..], self.kdf_iterations);
        let ciphertext = Aes256CbcEnc::new_from_slices(&key, &iv)
            .map_err(|e| Error::invalid_credential_file(e.to_string()))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        Ok((salt, iv, ciphertext))
    }

    fn decrypt(&self, salt: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<String> {
        let iterations = parse_salt_header(salt)?;
        let key = self.derive_key(&salt[SALT_HEADER_LEN..], iterations);

        let plaintext = Aes256CbcDec::new_from_slices(&key, iv)
            .map_err(|_| Error::invalid_credential_file("bad IV length"))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| Error::invalid_credential_file("wrong password or corrupt file"))?;

        String::from_utf8(plaintext)
            .map_err(|_| Error::invalid_credential_file("wrong password or corrupt file"))
    }

    fn derive_key(&self, salt: &[u8], iterations: u32) -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(self.password.as_bytes(), salt, iterations, &mut key);
        key
    }
}

fn parse_salt_header(salt: &[u8]) -> Result<u32> {
    if salt.len() != SALT_LEN || salt[0] != SALT_MARKER || salt[3] != SALT_MARKER {
        return Err(Error::invalid_credential_file("bad salt header"));
    }
    let iterations = u32::from(u16::from_be_bytes([salt[1], salt[2]]));
    check_iterations(iterations)?;
    Ok(iterations)
}

fn check_iterations(iterations: u32) -> Result<()> {
    if (MIN_KDF_ITERATIONS..=MAX_KDF_ITERATIONS).contains(&iterations) {
        Ok(())
    } else {
        Err(Error::invalid_credential_file(format!(
            "KDF iterations must be in {}..={}",
            MIN_KDF_ITERATIONS, MAX_KDF_ITERATIONS
        )))
    }
}

fn decode_b64(field: &str, value: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value.trim())
        .map_err(|_| Error::invalid_credential_file(format!("bad base64 in {}", field)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials_json() -> String {
        serde_json::json!({
            "access_token": "Atna|access",
            "refresh_token": "Atnr|refresh",
            "expires": 1_700_000_000.5,
            "adp_token": "{enc:...}",
            "device_private_key": "MIIE...",
            "store_authentication_cookie": {"cookie": "store"},
            "website_cookies": {"session-id": "123"},
            "device_info": {
                "device_name": "Jane's Audible for iPhone",
                "device_serial_number": "ABC",
                "device_type": "A2CZJZGLK2JJVM"
            },
            "customer_info": {"user_id": "amzn1.account.X", "given_name": "Jane"},
            "locale_code": "de",
            "with_username": false
        })
        .to_string()
    }

    fn is_invalid_file<T>(result: Result<T>) -> bool {
        matches!(result, Err(Error::InvalidCredentialFile(_)))
    }

    #[test]
    fn test_import_plain_json() {
        let bundle = import_credentials(credentials_json().as_bytes(), None).unwrap();
        assert_eq!(bundle.access_token, "Atna|access");
        assert_eq!(bundle.locale_code, "de");
        assert_eq!(bundle.device_info.device_serial_number, "ABC");
        assert_eq!(bundle.expires.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_import_dict_encrypted() {
        let dict = CredentialCipher::new("hunter2")
            .encrypt_to_dict(&credentials_json())
            .unwrap();
        let file = serde_json::to_vec(&dict).unwrap();

        let bundle = import_credentials(&file, Some("hunter2")).unwrap();
        assert_eq!(bundle.refresh_token, "Atnr|refresh");
        assert!(is_invalid_file(import_credentials(&file, Some("wrong"))));
        assert!(is_invalid_file(import_credentials(&file, None)));
    }

    #[test]
    fn test_import_bytes_encrypted() {
        let file = CredentialCipher::new("hunter2")
            .encrypt_to_bytes(&credentials_json())
            .unwrap();
        // The 1000-iteration salt header is never valid UTF-8
        assert!(std::str::from_utf8(&file).is_err());

        let bundle = import_credentials(&file, Some("hunter2")).unwrap();
        assert_eq!(bundle.device_name(), "Jane's Audible for iPhone");
        assert!(is_invalid_file(import_credentials(&file, Some("wrong"))));
        assert!(is_invalid_file(import_credentials(&file, None)));
    }

    #[test]
    fn test_salt_header_records_iterations() {
        let cipher = CredentialCipher::new("pw").with_kdf_iterations(4096).unwrap();
        let bytes = cipher.encrypt_to_bytes("{}").unwrap();
        assert_eq!(bytes[0], b'$');
        assert_eq!(u16::from_be_bytes([bytes[1], bytes[2]]), 4096);
        assert_eq!(bytes[3], b'$');
        assert_eq!(cipher.decrypt_bytes(&bytes).unwrap(), "{}");
    }

    #[test]
    fn test_iteration_bounds() {
        assert!(CredentialCipher::new("pw").with_kdf_iterations(999).is_err());
        assert!(CredentialCipher::new("pw").with_kdf_iterations(65536).is_err());
        assert!(CredentialCipher::new("pw").with_kdf_iterations(65535).is_ok());
    }

    #[test]
    fn test_bad_salt_header_rejected() {
        let cipher = CredentialCipher::new("pw");
        let mut bytes = cipher.encrypt_to_bytes("{}").unwrap();
        bytes[0] = b'#';
        assert!(is_invalid_file(cipher.decrypt_bytes(&bytes)));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(is_invalid_file(import_credentials(b"not json at all", None)));
        assert!(is_invalid_file(import_credentials(b"{\"access_token\": 1}", None)));
        assert!(is_invalid_file(import_credentials(&[0xff, 0xfe, 0x00], Some("pw"))));

        let bad_b64 = br#"{"salt": "!!", "iv": "AA==", "ciphertext": "AA=="}"#;
        assert!(is_invalid_file(import_credentials(bad_b64, Some("pw"))));
    }
}
