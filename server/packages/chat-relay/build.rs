use std::env;
use std::fs;
use std::path::{Path, PathBuf};

fn main() {
    println!("cargo:rerun-if-env-changed=CHAT_RELAY_VERSION");

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR"));
    generate_version(&out_dir);
}

fn generate_version(out_dir: &Path) {
    // Use CHAT_RELAY_VERSION env var if set, otherwise fall back to CARGO_PKG_VERSION
    let version = env::var("CHAT_RELAY_VERSION")
        .unwrap_or_else(|_| env::var("CARGO_PKG_VERSION").expect("CARGO_PKG_VERSION"));

    let out_file = out_dir.join("version.rs");
    let contents = format!(
        "/// Version string for this build.\n\
         /// Set via CHAT_RELAY_VERSION env var at build time, or falls back to Cargo.toml version.\n\
         pub const VERSION: &str = \"{}\";\n",
        version
    );

    fs::write(&out_file, contents).expect("write version.rs");
}
