#![no_main]

use libfuzzer_sys::fuzz_target;
use remote_object::utils::compression::{compress, decompress, CompressionKind};

fuzz_target!(|data: &[u8]| {
    for kind in [CompressionKind::Lz4, CompressionKind::Zstd] {
        if let Ok(compressed) = compress(data, kind) {
            let _ = decompress(&compressed, kind);
        }
        // malformed input must respect the size limits
        let _ = decompress(data, kind);
    }
});
