//! Unencrypted key material for tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use russh_keys::key::KeyPair;

/// Generate a fresh unencrypted ed25519 key and write it as PKCS#8 PEM.
///
/// Returns the key pair and the file path; the caller removes the file.
pub fn write_test_key(prefix: &str) -> (KeyPair, PathBuf) {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);

    let key = KeyPair::generate_ed25519().expect("ed25519 keygen");
    let path = std::env::temp_dir().join(format!(
        "{}-{}-{}.pem",
        prefix,
        std::process::id(),
        n
    ));
    let mut file = std::fs::File::create(&path).expect("create key file");
    russh_keys::encode_pkcs8_pem(&key, &mut file).expect("encode key");
    (key, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_key_decodes_unencrypted() {
        let (_key, path) = write_test_key("sshtun-test-key");
        let pem = std::fs::read_to_string(&path).expect("read key file");
        russh_keys::decode_secret_key(&pem, None).expect("decode");
        let _ = std::fs::remove_file(&path);
    }
}
