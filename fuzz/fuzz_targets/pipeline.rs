#![no_main]

use avdec::backend::dummy;
use avdec::decoder::AccessUnit;
use avdec::decoder::DecodePipeline;
use avdec::timing::Rational;
use avdec::timing::StreamClock;
use avdec::timing::NOPTS_VALUE;
use avdec::CodecKind;
use libfuzzer_sys::fuzz_target;

// The first byte selects the codec and how much of the input is extradata. The rest is split in
// access units on every 0xff byte.
fuzz_target!(|data: &[u8]| {
    let Some((&selector, data)) = data.split_first() else {
        return;
    };

    let codec = if selector & 0x80 == 0 {
        CodecKind::H264
    } else {
        CodecKind::H265
    };
    let extradata_len = usize::from(selector & 0x7f).min(data.len());
    let (extradata, data) = data.split_at(extradata_len);

    let backend = dummy::Backend::new();
    backend.set_auto_complete(true);

    let mut pipeline = DecodePipeline::new(backend, |_| ());
    let _ = pipeline.configure(codec, extradata);

    let clock = StreamClock::new(Rational::new(1, 90000), Rational::new(30, 1));
    for (i, access_unit) in data.split(|&b| b == 0xff).enumerate() {
        // Every fourth access unit comes without timestamp.
        let pts = if i % 4 == 3 { NOPTS_VALUE } else { i as i64 };
        let _ = pipeline.submit(&AccessUnit::new(access_unit, clock).with_pts(pts));
    }

    let _ = pipeline.flush();
    pipeline.stop();
});
