//! Embeds the daemon image for the compilation target.
//!
//! The build pipeline cross-compiles `burnafter-daemon` per target and
//! points `BURNAFTER_DAEMON_IMAGE` at the binary; this script gzips it into
//! OUT_DIR for `include_bytes!`. Without the variable an empty placeholder
//! is embedded and launching reports a structured error at runtime, which
//! keeps plain `cargo build` / `cargo test` working.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use flate2::write::GzEncoder;
use flate2::Compression;

fn main() {
    println!("cargo:rerun-if-env-changed=BURNAFTER_DAEMON_IMAGE");

    let out_path = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"))
        .join("daemon-image.gz");

    match env::var("BURNAFTER_DAEMON_IMAGE") {
        Ok(image_path) if !image_path.is_empty() => {
            println!("cargo:rerun-if-changed={image_path}");
            let image = std::fs::read(&image_path)
                .unwrap_or_else(|e| panic!("reading daemon image {image_path}: {e}"));

            let file = File::create(&out_path).expect("creating embedded image file");
            let mut encoder = GzEncoder::new(file, Compression::best());
            encoder
                .write_all(&image)
                .and_then(|_| encoder.finish().map(|_| ()))
                .expect("compressing daemon image");
        }
        _ => {
            std::fs::write(&out_path, []).expect("writing empty image placeholder");
        }
    }
}
