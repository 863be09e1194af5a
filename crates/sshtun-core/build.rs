//! Embeds the `tunreadwriter` helper binary into the orchestrator.
//!
//! Cargo cannot express a dependency on another crate's compiled binary on
//! stable, so the helper is embedded from the path named by the
//! `SSHTUN_HELPER_BIN` environment variable (a previously built
//! `tunreadwriter`). Without it an empty placeholder is embedded and helper
//! upload fails at runtime with instructions to rebuild.

use std::env;
use std::fs;
use std::path::PathBuf;

fn main() {
    let out = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set")).join("tunreadwriter.bin");

    println!("cargo:rerun-if-env-changed=SSHTUN_HELPER_BIN");

    match env::var("SSHTUN_HELPER_BIN") {
        Ok(path) if !path.is_empty() => {
            println!("cargo:rerun-if-changed={}", path);
            fs::copy(&path, &out).unwrap_or_else(|e| {
                panic!("failed to copy helper binary from {}: {}", path, e);
            });
        }
        _ => {
            fs::write(&out, []).expect("failed to write helper placeholder");
        }
    }
}
