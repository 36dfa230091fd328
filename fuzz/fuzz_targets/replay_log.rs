#![no_main]

use libfuzzer_sys::fuzz_target;
use nplusone::caller::FixedFrames;
use nplusone::report::CollectingSink;
use nplusone::Finder;

fuzz_target!(|data: &[u8]| {
    let source = String::from_utf8_lossy(data);
    let Ok(finder) = Finder::builder()
        .sink(CollectingSink::new())
        .frame_source(FixedFrames::default())
        .build()
    else {
        return;
    };

    let summary = nplusone::replay::replay(&finder, "fuzz.log", &source);
    assert!(!finder.is_open());
    assert!(summary.findings.len() <= summary.statements);
});
