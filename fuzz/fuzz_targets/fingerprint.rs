#![no_main]

use libfuzzer_sys::fuzz_target;
use nplusone::{Fingerprinter, SqlFingerprinter};

fuzz_target!(|data: &[u8]| {
    if let Ok(sql) = std::str::from_utf8(data) {
        // Must not panic, and must be deterministic
        let first = SqlFingerprinter.fingerprint(sql);
        assert_eq!(first, SqlFingerprinter.fingerprint(sql));
    }
});
