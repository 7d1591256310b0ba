use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, Subcommand};

/// Quarter-turn rotations accepted by `transform --rotate`.
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RotateArg {
    #[value(name = "90")]
    Rot90,
    #[value(name = "180")]
    Rot180,
    #[value(name = "270")]
    Rot270,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlipArg {
    /// Mirror left-right
    #[value(name = "h")]
    Horizontal,
    /// Mirror top-bottom
    #[value(name = "v")]
    Vertical,
}

/// `x,y,w,h` pixel rectangle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CropArg {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl FromStr for CropArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<i32> = s
            .split(',')
            .map(|p| p.trim().parse::<i32>())
            .collect::<Result<_, _>>()
            .map_err(|e| format!("invalid crop rectangle '{s}': {e}"))?;
        match parts.as_slice() {
            &[x, y, w, h] if w > 0 && h > 0 => Ok(Self { x, y, w, h }),
            _ => Err(format!("crop rectangle must be x,y,w,h with positive size, got '{s}'")),
        }
    }
}

/// `WxH` target size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeArg {
    pub width: u32,
    pub height: u32,
}

impl FromStr for SizeArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("size must be WxH, got '{s}'"))?;
        let width: u32 = w.trim().parse().map_err(|e| format!("invalid width '{w}': {e}"))?;
        let height: u32 = h.trim().parse().map_err(|e| format!("invalid height '{h}': {e}"))?;
        if width == 0 || height == 0 {
            return Err(format!("size must be non-zero, got '{s}'"));
        }
        Ok(Self { width, height })
    }
}

/// Inspect, convert and transform image files.
///
/// Log verbosity follows `RUST_LOG` when set.
#[derive(Parser, Debug)]
#[command(name = "dimg", author, version, about, long_about = None)]
pub struct Args {
    /// Log at debug level
    #[arg(short, long, global = true, env = "DIMG_VERBOSE")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print format, geometry and fingerprints without decoding pixels
    Info {
        path: PathBuf,
        /// Print a JSON object instead of text
        #[arg(long)]
        json: bool,
    },
    /// Load a file and write it in another format
    Convert {
        input: PathBuf,
        output: PathBuf,
        /// Output format; defaults to the output extension
        #[arg(short, long)]
        format: Option<String>,
        /// Encoder quality, 0-100
        #[arg(short, long, env = "DIMG_QUALITY", value_parser = clap::value_parser!(u8).range(0..=100))]
        quality: Option<u8>,
        /// Use lossless compression where the format has it (TIFF deflate)
        #[arg(short, long)]
        compress: bool,
    },
    /// Print the content fingerprint of a file
    Hash {
        path: PathBuf,
        /// Legacy fingerprint (head and tail of the file plus Exif)
        #[arg(long)]
        legacy: bool,
    },
    /// Apply geometry steps and record them in the image history
    Transform {
        input: PathBuf,
        output: PathBuf,
        /// Crop to x,y,w,h before the other steps
        #[arg(long)]
        crop: Option<CropArg>,
        /// Clockwise rotation
        #[arg(long, value_enum)]
        rotate: Option<RotateArg>,
        #[arg(long, value_enum)]
        flip: Option<FlipArg>,
        /// Final size as WxH
        #[arg(long)]
        scale: Option<SizeArg>,
        /// Output format; defaults to the output extension
        #[arg(short, long)]
        format: Option<String>,
    },
    /// Print the image history stored in a file as XML
    History { path: PathBuf },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crop_parsing() {
        assert_eq!(
            "1, 2,30,40".parse::<CropArg>(),
            Ok(CropArg { x: 1, y: 2, w: 30, h: 40 })
        );
        assert!("1,2,3".parse::<CropArg>().is_err());
        assert!("0,0,0,5".parse::<CropArg>().is_err());
        assert!("a,b,c,d".parse::<CropArg>().is_err());
    }

    #[test]
    fn test_size_parsing() {
        assert_eq!("640x480".parse::<SizeArg>(), Ok(SizeArg { width: 640, height: 480 }));
        assert_eq!("8X4".parse::<SizeArg>(), Ok(SizeArg { width: 8, height: 4 }));
        assert!("640".parse::<SizeArg>().is_err());
        assert!("0x10".parse::<SizeArg>().is_err());
    }

    #[test]
    fn test_transform_command_line() {
        let args = Args::try_parse_from([
            "dimg", "transform", "in.png", "out.png", "--rotate", "270", "--flip", "h", "--scale",
            "10x20",
        ])
        .unwrap();
        match args.command {
            Command::Transform {
                rotate, flip, scale, crop, ..
            } => {
                assert_eq!(rotate, Some(RotateArg::Rot270));
                assert_eq!(flip, Some(FlipArg::Horizontal));
                assert_eq!(scale, Some(SizeArg { width: 10, height: 20 }));
                assert_eq!(crop, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_quality_out_of_range_is_rejected() {
        assert!(Args::try_parse_from(["dimg", "convert", "a.png", "b.jpg", "-q", "101"]).is_err());
    }
}
