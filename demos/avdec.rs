// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! avdec, a simple program decoding an Annex B H.264 or H.265 elementary stream with avdec.
//!
//! Access units are delimited using the first slice of each picture. Parameter sets are taken
//! in-band unless a codec configuration file is given.

use std::path::PathBuf;
use std::str::FromStr;

use argh::FromArgs;

use avdec::backend::dummy;
use avdec::backend::DecoderBackend;
use avdec::decoder::AccessUnit;
use avdec::decoder::DecodePipeline;
use avdec::decoder::DecodedPicture;
use avdec::framing::AnnexBNalus;
use avdec::timing::Rational;
use avdec::timing::StreamClock;
use avdec::CodecKind;
use avdec::DecodedFormat;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
enum BackendKind {
    Dummy,
    VideoToolbox,
}

impl FromStr for BackendKind {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dummy" => Ok(BackendKind::Dummy),
            "videotoolbox" | "vt" => Ok(BackendKind::VideoToolbox),
            _ => Err("unrecognized backend. Valid values: dummy, videotoolbox"),
        }
    }
}

/// Simple decoder using avdec
#[derive(Debug, FromArgs)]
struct Args {
    /// input file, an Annex B elementary stream
    #[argh(positional)]
    input: PathBuf,

    /// input format to decode from (h264 or h265).
    #[argh(option)]
    input_format: CodecKind,

    /// codec configuration data (avcC/hvcC record or Annex B parameter sets)
    #[argh(option)]
    extradata: Option<PathBuf>,

    /// frame rate of the stream. Default: 30
    #[argh(option, default = "30")]
    fps: i64,

    /// decoder backend to use (dummy or videotoolbox). Default: dummy
    #[argh(option, default = "BackendKind::Dummy")]
    backend: BackendKind,

    /// pixel format to decode into. Default: nv12
    #[cfg_attr(not(all(feature = "videotoolbox", target_os = "macos")), allow(dead_code))]
    #[argh(option, default = "DecodedFormat::NV12")]
    output_format: DecodedFormat,

    /// output file to write the decoded frames to. Only supported by the videotoolbox backend.
    #[cfg_attr(not(all(feature = "videotoolbox", target_os = "macos")), allow(dead_code))]
    #[argh(option)]
    output: Option<PathBuf>,
}

/// Splits an Annex B stream into access units, each starting with its non-VCL NAL units.
fn split_access_units(codec: CodecKind, input: &[u8]) -> Vec<Vec<u8>> {
    let mut access_units = Vec::new();
    let mut current = Vec::new();
    let mut has_picture = false;

    for nalu in AnnexBNalus::new(input) {
        let vcl = codec.is_vcl(nalu);

        if has_picture && (!vcl || codec.is_first_slice(nalu)) {
            access_units.push(std::mem::take(&mut current));
            has_picture = false;
        }

        current.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
        current.extend_from_slice(nalu);
        has_picture |= vcl;
    }

    if has_picture {
        access_units.push(current);
    }

    access_units
}

fn run<B, F>(backend: B, args: &Args, extradata: &[u8], access_units: &[Vec<u8>], on_picture: F)
where
    B: DecoderBackend,
    F: FnMut(DecodedPicture<B::Picture>) + Send + 'static,
{
    let mut pipeline = DecodePipeline::new(backend, on_picture);
    if let Err(e) = pipeline.configure(args.input_format, extradata) {
        log::error!("invalid extradata: {}", e);
    }

    let clock = StreamClock::new(Rational::new(1, args.fps), Rational::new(args.fps, 1));
    for (i, data) in access_units.iter().enumerate() {
        let access_unit = AccessUnit::new(data, clock)
            .with_pts(i as i64)
            .with_duration(1);

        if let Err(e) = pipeline.submit(&access_unit) {
            log::warn!("access unit {} dropped: {}", i, e);
        }
    }

    if let Err(e) = pipeline.flush() {
        log::error!("failed to flush: {}", e);
    }

    let stats = pipeline.stats();
    println!(
        "{} access units submitted, {} pictures delivered, {} not ready, {} malformed, {} submit \
         failures, {} decode errors",
        stats.submitted,
        stats.delivered,
        stats.not_ready,
        stats.normalize_failures,
        stats.submit_failures,
        stats.decode_errors,
    );

    pipeline.stop();
}

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();

    let input = std::fs::read(&args.input).expect("error reading input file");
    let extradata = args
        .extradata
        .as_ref()
        .map(|path| std::fs::read(path).expect("error reading extradata file"))
        .unwrap_or_default();

    let access_units = split_access_units(args.input_format, &input);
    log::info!("{} access units in input", access_units.len());

    match args.backend {
        BackendKind::Dummy => {
            let backend = dummy::Backend::new();
            backend.set_auto_complete(true);

            let on_picture = |picture: DecodedPicture<dummy::Picture>| {
                println!(
                    "picture at {:.3}s, duration {:.3}s, {} bytes",
                    picture.presentation_time,
                    picture.duration,
                    picture.picture.data.len()
                );
            };

            run(backend, &args, &extradata, &access_units, on_picture);
        }
        #[cfg(all(feature = "videotoolbox", target_os = "macos"))]
        BackendKind::VideoToolbox => {
            use std::fs::File;
            use std::io::Write;

            use avdec::backend::videotoolbox;

            let format = args.output_format;
            let mut output = args
                .output
                .as_ref()
                .map(|path| File::create(path).expect("error creating output file"));

            let on_picture = move |picture: DecodedPicture<videotoolbox::PixelBuffer>| {
                let resolution = picture.picture.resolution();
                println!(
                    "picture at {:.3}s, duration {:.3}s, {}x{}",
                    picture.presentation_time,
                    picture.duration,
                    resolution.width,
                    resolution.height
                );

                if let Some(output) = output.as_mut() {
                    let mut frame = vec![
                        0;
                        avdec::decoded_frame_size(
                            format,
                            resolution.width as usize,
                            resolution.height as usize
                        )
                    ];
                    match picture.picture.read(&mut frame) {
                        Ok(()) => output.write_all(&frame).expect("error writing output file"),
                        Err(e) => log::warn!("failed to read picture: {:#}", e),
                    }
                }
            };

            run(
                videotoolbox::Backend::new(format),
                &args,
                &extradata,
                &access_units,
                on_picture,
            );
        }
        #[cfg(not(all(feature = "videotoolbox", target_os = "macos")))]
        BackendKind::VideoToolbox => {
            panic!("avdec was built without the videotoolbox feature");
        }
    }
}
