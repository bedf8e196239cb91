//! Tool invocation plans per media format.

use std::ffi::OsString;
use std::path::Path;

use optimiser_core::OptimiseOptions;

use crate::format::{MediaFormat, MediaKind};
use crate::tools::Tool;

/// One argument of a tool command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Lit(String),
    Input,
    Output,
}

/// How a step consumes its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    /// The tool reads `Input` and writes `Output`.
    InputOutput,
    /// The input is copied to `Output` first and the tool rewrites it in place.
    InPlace,
}

/// A single tool run in an optimisation chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub tool: Tool,
    pub mode: StepMode,
    pub args: Vec<Arg>,
    /// Exit codes meaning the tool gave up without a gain. The step's input
    /// then passes through to the next step unchanged.
    pub pass_through: &'static [i32],
}

/// pngquant: 99 when the minimum quality is out of reach, 98 when the
/// result would be larger (`--skip-if-larger`).
const PNGQUANT_NO_GAIN: &[i32] = &[98, 99];

impl Step {
    fn new(tool: Tool, mode: StepMode, args: Vec<Arg>) -> Self {
        Self {
            tool,
            mode,
            args,
            pass_through: &[],
        }
    }

    fn passing_through(mut self, codes: &'static [i32]) -> Self {
        self.pass_through = codes;
        self
    }

    /// Concrete arguments for the given input and output paths.
    pub fn command_args(&self, input: &Path, output: &Path) -> Vec<OsString> {
        self.args
            .iter()
            .map(|arg| match arg {
                Arg::Lit(s) => OsString::from(s),
                Arg::Input => input.as_os_str().to_owned(),
                Arg::Output => output.as_os_str().to_owned(),
            })
            .collect()
    }
}

fn lit(s: impl Into<String>) -> Arg {
    Arg::Lit(s.into())
}

fn lits<const N: usize>(items: [&str; N]) -> Vec<Arg> {
    items.into_iter().map(lit).collect()
}

/// ffmpeg scale filter keeping dimensions even, which video encoders need.
fn scale_filter(factor: f32) -> String {
    format!("scale=trunc(iw*{factor}/2)*2:trunc(ih*{factor}/2)*2")
}

fn ffmpeg_prelude() -> Vec<Arg> {
    let mut args = lits(["-y", "-hide_banner", "-loglevel", "error", "-i"]);
    args.push(Arg::Input);
    args
}

/// Build the chain of steps for a format. Steps run in order, each consuming
/// the previous output.
pub fn plan(format: MediaFormat, options: &OptimiseOptions) -> Vec<Step> {
    let mut steps = Vec::new();

    if let Some(factor) = options.downscale_factor
        && format.kind() == MediaKind::Image
    {
        let mut args = ffmpeg_prelude();
        args.extend([lit("-vf"), lit(scale_filter(factor)), Arg::Output]);
        steps.push(Step::new(Tool::Ffmpeg, StepMode::InputOutput, args));
    }

    match format {
        MediaFormat::Png => {
            let quality = if options.aggressive { "0-70" } else { "65-90" };
            let mut args = lits(["--force", "--skip-if-larger", "--speed", "3", "--strip"]);
            args.push(lit(format!("--quality={quality}")));
            args.extend([lit("--output"), Arg::Output, lit("--"), Arg::Input]);
            steps.push(
                Step::new(Tool::Pngquant, StepMode::InputOutput, args)
                    .passing_through(PNGQUANT_NO_GAIN),
            );

            let level = if options.aggressive { "4" } else { "2" };
            let mut args = lits(["-o", level, "--strip", "safe", "--out"]);
            args.extend([Arg::Output, Arg::Input]);
            steps.push(Step::new(Tool::Oxipng, StepMode::InputOutput, args));
        }
        MediaFormat::Jpeg => {
            let max = if options.aggressive { "70" } else { "85" };
            let mut args = lits(["--strip-all", "--all-progressive", "--quiet"]);
            args.push(lit(format!("--max={max}")));
            args.push(Arg::Output);
            steps.push(Step::new(Tool::Jpegoptim, StepMode::InPlace, args));
        }
        MediaFormat::Gif => {
            let lossy = if options.aggressive { "--lossy=80" } else { "--lossy=20" };
            let mut args = lits(["-O3", lossy, "-o"]);
            args.extend([Arg::Output, Arg::Input]);
            steps.push(Step::new(Tool::Gifsicle, StepMode::InputOutput, args));
        }
        MediaFormat::WebP => {
            let quality = if options.aggressive { "60" } else { "80" };
            let mut args = lits(["-quiet", "-mt", "-m", "6", "-q", quality]);
            args.extend([Arg::Input, lit("-o"), Arg::Output]);
            steps.push(Step::new(Tool::Cwebp, StepMode::InputOutput, args));
        }
        MediaFormat::Mp4 | MediaFormat::Mov => steps.push(video_step(format, options)),
    }

    steps
}

fn video_step(format: MediaFormat, options: &OptimiseOptions) -> Step {
    let crf = if options.aggressive { "30" } else { "26" };
    let mut args = ffmpeg_prelude();
    if let Some(factor) = options.downscale_factor {
        args.extend([lit("-vf"), lit(scale_filter(factor))]);
    }
    args.extend(lits([
        "-c:v", "libx264", "-crf", crf, "-preset", "slow", "-c:a", "aac", "-b:a", "128k",
    ]));
    if format == MediaFormat::Mp4 {
        args.extend(lits(["-movflags", "+faststart"]));
    }
    args.push(Arg::Output);
    Step::new(Tool::Ffmpeg, StepMode::InputOutput, args)
}
