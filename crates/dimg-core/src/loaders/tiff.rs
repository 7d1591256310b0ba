//! TIFF codec on top of the `tiff` crate.
//!
//! Strip-organized files are decoded strip by strip so the observer can
//! cancel between strips; tiled files are decoded in one call. Samples of
//! 1 to 32 bits and IEEE floats are normalized to the canonical layout.
//! Floating point data is tone mapped: values are divided by
//! `log10(max) * 1.5` and raised to 0.75 when the maximum exceeds 10.
//!
//! The IFD0 side data (ICC, XMP, IPTC and the descriptive Exif fields) is
//! read with `kamadak-exif`, which walks the same directory structure.

use std::fs::File;
use std::io::{BufWriter, Cursor, Seek, Write};
use std::path::Path;

use exif::{Context, Field, In, Value};
use tiff::decoder::{ChunkType, Decoder, DecodingResult};
use tiff::encoder::colortype::{self, ColorType as EncoderColor};
use tiff::encoder::{
    Compression, DeflateLevel, DirectoryEncoder, Ifd, Predictor, Rational, SRational,
    TiffEncoder, TiffKind, TiffValue,
};
use tiff::tags::{PlanarConfiguration, Tag};
use tiff::ColorType;

use super::{
    DImgLoader, LoadContext, LoadFlags, LoadedImage, LoaderState, SaveContext, get_rgba, put_bgra,
    scale_to_u16, write_atomically,
};
use crate::error::{DImgError, Result};
use crate::image::{ColorModel, DImg, IccProfile};

const TAG_XMP: u16 = 700;
const TAG_IPTC: u16 = 33723;
const TAG_ICC: u16 = 34675;

/// IFD0 fields carried over between the container and the Exif block.
/// Everything else in IFD0 describes the pixel layout.
const DESCRIPTIVE_TAGS: [u16; 10] = [269, 270, 271, 272, 282, 283, 296, 306, 315, 33432];

/// Target strip size when writing.
const STRIP_BYTES: usize = 64 * 1024;

#[derive(Debug, Default)]
pub struct TiffLoader {
    state: LoaderState,
}

/// How samples map to color.
#[derive(Debug, Clone)]
enum Photometric {
    Gray { white_is_zero: bool },
    Rgb,
    Palette(Vec<u16>),
    Cmyk,
}

/// Pixel layout of the first image directory.
#[derive(Debug, Clone)]
struct Layout {
    width: u32,
    height: u32,
    photometric: Photometric,
    samples_per_pixel: usize,
    bits: u8,
    alpha: bool,
    planar: bool,
}

impl Layout {
    fn read<R: std::io::Read + Seek>(decoder: &mut Decoder<R>) -> Result<Self> {
        let (width, height) = decoder.dimensions()?;
        let color = decoder.colortype()?;
        let planar = decoder
            .find_tag_unsigned::<u16>(Tag::PlanarConfiguration)?
            .and_then(PlanarConfiguration::from_u16)
            == Some(PlanarConfiguration::Planar);

        let (photometric, samples_per_pixel, alpha, bits) = match color {
            ColorType::Gray(b) => {
                let white_is_zero =
                    decoder.find_tag_unsigned::<u16>(Tag::PhotometricInterpretation)? == Some(0);
                (Photometric::Gray { white_is_zero }, 1, false, b)
            }
            ColorType::GrayA(b) => (Photometric::Gray { white_is_zero: false }, 2, true, b),
            ColorType::RGB(b) => (Photometric::Rgb, 3, false, b),
            ColorType::RGBA(b) => (Photometric::Rgb, 4, true, b),
            ColorType::CMYK(b) => (Photometric::Cmyk, 4, false, b),
            ColorType::CMYKA(b) => (Photometric::Cmyk, 5, true, b),
            ColorType::Palette(b) => {
                let map = decoder.get_tag_u16_vec(Tag::ColorMap)?;
                let entries = 1usize << b;
                if map.len() < entries * 3 {
                    return Err(DImgError::decode("TIFF", "color map too short"));
                }
                (Photometric::Palette(map), 1, false, b)
            }
            other => {
                return Err(DImgError::Unsupported(format!("TIFF color type {other:?}")));
            }
        };

        Ok(Self {
            width,
            height,
            photometric,
            samples_per_pixel,
            bits,
            alpha,
            planar,
        })
    }

    /// Palette images are expanded to 8 bits like any indexed source.
    fn sixteen_bit(&self) -> bool {
        self.bits > 8 && !matches!(self.photometric, Photometric::Palette(_))
    }

    fn color_model(&self) -> ColorModel {
        match self.photometric {
            Photometric::Gray { .. } if self.bits == 1 => ColorModel::Monochrome,
            Photometric::Gray { .. } => ColorModel::Grayscale,
            Photometric::Rgb => ColorModel::Rgb,
            Photometric::Palette(_) => ColorModel::Indexed,
            Photometric::Cmyk => ColorModel::Cmyk,
        }
    }
}

/// Decoded samples of one chunk.
enum Samples {
    Int { values: Vec<u32>, bits: u32 },
    Float(Vec<f32>),
}

impl Samples {
    fn from_result(result: DecodingResult, bits: u8, row_samples: usize, rows: usize) -> Result<Self> {
        Ok(match result {
            DecodingResult::U8(v) if bits < 8 => Self::Int {
                values: unpack_bits(&v, bits, row_samples, rows),
                bits: bits.into(),
            },
            DecodingResult::U8(v) => Self::Int {
                values: v.into_iter().map(u32::from).collect(),
                bits: 8,
            },
            DecodingResult::U16(v) => Self::Int {
                values: v.into_iter().map(u32::from).collect(),
                bits: 16,
            },
            DecodingResult::U32(v) => Self::Int { values: v, bits: 32 },
            DecodingResult::U64(v) => Self::Int {
                values: v.into_iter().map(|x| (x >> 32) as u32).collect(),
                bits: 32,
            },
            DecodingResult::F16(v) => Self::Float(v.into_iter().map(|x| x.to_f32()).collect()),
            DecodingResult::F32(v) => Self::Float(v),
            DecodingResult::F64(v) => Self::Float(v.into_iter().map(|x| x as f32).collect()),
            _ => return Err(DImgError::Unsupported("signed integer TIFF samples".into())),
        })
    }

    fn max_float(&self) -> f32 {
        match self {
            Self::Float(v) => v.iter().copied().fold(0.0, f32::max),
            Self::Int { .. } => 0.0,
        }
    }

    /// Raw integer sample, used for palette indices.
    fn raw(&self, i: usize) -> usize {
        match self {
            Self::Int { values, .. } => values[i] as usize,
            Self::Float(v) => v[i].max(0.0) as usize,
        }
    }

    /// Sample scaled to 16 bits.
    fn level(&self, i: usize, is_alpha: bool, tone: ToneMap) -> u16 {
        match self {
            Self::Int { values, bits } => scale_to_u16(values[i], *bits),
            Self::Float(v) if is_alpha => tone.alpha(v[i]),
            Self::Float(v) => tone.color(v[i]),
        }
    }
}

/// Floating point to 16-bit mapping derived from the image maximum.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ToneMap {
    factor: f64,
    scale: f64,
}

impl Default for ToneMap {
    fn default() -> Self {
        Self { factor: 1.0, scale: 1.0 }
    }
}

impl ToneMap {
    fn from_max(max: f32) -> Self {
        let max = f64::from(max);
        let factor = if max > 10.0 { max.log10() * 1.5 } else { 1.0 };
        let scale = if factor > 1.0 { 0.75 } else { 1.0 };
        Self { factor, scale }
    }

    fn color(self, v: f32) -> u16 {
        ((f64::from(v) / self.factor).max(0.0).powf(self.scale) * 65535.0).clamp(0.0, 65535.0) as u16
    }

    fn alpha(self, v: f32) -> u16 {
        (f64::from(v) * 65535.0).clamp(0.0, 65535.0) as u16
    }
}

/// Expand packed sub-byte samples; each row starts on a byte boundary.
fn unpack_bits(data: &[u8], bits: u8, row_samples: usize, rows: usize) -> Vec<u32> {
    let bits = usize::from(bits.max(1));
    let row_bytes = (row_samples * bits).div_ceil(8);
    let mask = (1u32 << bits) - 1;
    let mut out = Vec::with_capacity(row_samples * rows);
    for row in data.chunks(row_bytes).take(rows) {
        for k in 0..row_samples {
            let bit = k * bits;
            let byte = row.get(bit / 8).copied().unwrap_or(0);
            let shift = 8 - bits - bit % 8;
            out.push((u32::from(byte) >> shift) & mask);
        }
    }
    out
}

/// Where decoded samples land in the output buffer.
struct Target<'a> {
    layout: &'a Layout,
    data: &'a mut [u8],
    sixteen_bit: bool,
    tone: ToneMap,
}

impl Target<'_> {
    /// Write interleaved pixels covering rows `row0..` of width `chunk_width`.
    fn put_interleaved(&mut self, samples: &Samples, row0: u32, chunk_width: u32, rows: u32) {
        let spp = self.layout.samples_per_pixel;
        let bpp = if self.sixteen_bit { 8 } else { 4 };
        let stride = self.layout.width as usize * bpp;
        for r in 0..rows {
            let y = (row0 + r) as usize;
            if y >= self.layout.height as usize {
                break;
            }
            for x in 0..chunk_width.min(self.layout.width) as usize {
                let base = (r as usize * chunk_width as usize + x) * spp;
                let [red, green, blue, alpha] = self.pixel(samples, base);
                let offset = y * stride + x * bpp;
                let dst = &mut self.data[offset..offset + bpp];
                if self.sixteen_bit {
                    put_bgra(dst, true, red, green, blue, alpha);
                } else {
                    put_bgra(dst, false, red >> 8, green >> 8, blue >> 8, alpha >> 8);
                }
            }
        }
    }

    /// Write one separated plane into its channel slot.
    fn put_plane(&mut self, samples: &Samples, plane: usize, row0: u32, rows: u32) {
        let bpp = if self.sixteen_bit { 8 } else { 4 };
        let width = self.layout.width as usize;
        let is_alpha = self.layout.alpha && plane + 1 == self.layout.samples_per_pixel;
        // BGRA slots.
        let slots: &[usize] = match (&self.layout.photometric, plane, is_alpha) {
            (_, _, true) => &[3],
            (Photometric::Gray { .. }, 0, _) => &[0, 1, 2],
            (Photometric::Rgb, 0, _) => &[2],
            (Photometric::Rgb, 1, _) => &[1],
            (Photometric::Rgb, 2, _) => &[0],
            _ => &[],
        };
        for r in 0..rows as usize {
            let y = row0 as usize + r;
            if y >= self.layout.height as usize {
                break;
            }
            for x in 0..width {
                let mut level = samples.level(r * width + x, is_alpha, self.tone);
                if let Photometric::Gray { white_is_zero: true } = self.layout.photometric {
                    level = 65535 - level;
                }
                let offset = (y * width + x) * bpp;
                for &slot in slots {
                    if self.sixteen_bit {
                        let at = offset + slot * 2;
                        self.data[at..at + 2].copy_from_slice(&level.to_ne_bytes());
                    } else {
                        self.data[offset + slot] = (level >> 8) as u8;
                    }
                }
            }
        }
    }

    fn pixel(&self, samples: &Samples, base: usize) -> [u16; 4] {
        let layout = self.layout;
        let alpha = if layout.alpha {
            samples.level(base + layout.samples_per_pixel - 1, true, self.tone)
        } else {
            u16::MAX
        };
        let level = |i: usize| samples.level(base + i, false, self.tone);
        match &layout.photometric {
            Photometric::Gray { white_is_zero } => {
                let v = if *white_is_zero { 65535 - level(0) } else { level(0) };
                [v, v, v, alpha]
            }
            Photometric::Rgb => [level(0), level(1), level(2), alpha],
            Photometric::Palette(map) => {
                let entries = 1usize << layout.bits;
                let i = samples.raw(base).min(entries - 1);
                [map[i], map[entries + i], map[2 * entries + i], alpha]
            }
            Photometric::Cmyk => {
                let k = 65535 - u32::from(level(3));
                let channel = |c: u16| ((65535 - u32::from(c)) * k / 65535) as u16;
                [channel(level(0)), channel(level(1)), channel(level(2)), alpha]
            }
        }
    }
}

impl DImgLoader for TiffLoader {
    fn format_name(&self) -> &'static str {
        "TIFF"
    }

    fn state(&self) -> LoaderState {
        self.state
    }

    fn load(&mut self, path: &Path, ctx: &LoadContext<'_>) -> Result<LoadedImage> {
        let bytes = std::fs::read(path)?;
        let mut decoder = Decoder::new(Cursor::new(bytes.as_slice()))?;
        let layout = Layout::read(&mut decoder)?;
        tracing::debug!(
            "TIFF {}x{}, {:?}, {} samples of {} bits, planar: {}",
            layout.width,
            layout.height,
            layout.photometric,
            layout.samples_per_pixel,
            layout.bits,
            layout.planar
        );

        let sixteen_bit = layout.sixteen_bit();
        let mut image = LoadedImage::new(layout.width, layout.height, sixteen_bit, layout.alpha);
        ctx.report(0.1);

        if ctx.wants(LoadFlags::METADATA) || ctx.wants(LoadFlags::ICC_DATA) {
            read_side_data(&bytes, &mut image, ctx);
        }
        if ctx.wants(LoadFlags::METADATA) {
            image.read_history(ctx);
        }
        if ctx.wants(LoadFlags::ICC_DATA) {
            image.infer_icc_from_exif();
        }

        if ctx.wants_pixels() {
            ctx.check_cancel()?;
            image.allocate()?;
            decode_pixels(&mut decoder, &layout, &mut image.data, ctx)?;
        }

        image.set_origin("TIFF", layout.color_model(), u32::from(layout.bits));
        ctx.report(1.0);
        self.state = LoaderState {
            alpha: layout.alpha,
            sixteen_bit,
        };
        Ok(image)
    }

    fn save(&mut self, path: &Path, image: &DImg, ctx: &SaveContext<'_>) -> Result<()> {
        let compress = ctx.compress.unwrap_or(ctx.settings.tiff_compress);
        tracing::debug!(
            "TIFF save, {} bit, alpha: {}, deflate: {compress}",
            image.bits_depth(),
            image.has_alpha()
        );

        write_atomically(path, |target| {
            let file = BufWriter::new(File::create(target)?);
            let mut encoder = TiffEncoder::new(file)?;
            if compress {
                encoder = encoder
                    .with_compression(Compression::Deflate(DeflateLevel::Balanced))
                    .with_predictor(Predictor::Horizontal);
            }
            match (image.sixteen_bit(), image.has_alpha()) {
                (false, false) => write_image::<colortype::RGB8, u8, _>(&mut encoder, image, ctx),
                (false, true) => write_image::<colortype::RGBA8, u8, _>(&mut encoder, image, ctx),
                (true, false) => write_image::<colortype::RGB16, u16, _>(&mut encoder, image, ctx),
                (true, true) => write_image::<colortype::RGBA16, u16, _>(&mut encoder, image, ctx),
            }
        })?;

        ctx.report(1.0);
        self.state = LoaderState {
            alpha: image.has_alpha(),
            sixteen_bit: image.sixteen_bit(),
        };
        Ok(())
    }
}

fn decode_pixels<R: std::io::Read + Seek>(
    decoder: &mut Decoder<R>,
    layout: &Layout,
    data: &mut [u8],
    ctx: &LoadContext<'_>,
) -> Result<()> {
    let spp = layout.samples_per_pixel;
    let planes = if layout.planar { spp } else { 1 };
    let chunk_spp = if layout.planar { 1 } else { spp };

    if layout.planar && !matches!(layout.photometric, Photometric::Gray { .. } | Photometric::Rgb) {
        return Err(DImgError::Unsupported("separated planes for this TIFF color type".into()));
    }

    // (plane, first row, chunk width, rows, samples)
    let mut chunks: Vec<(usize, u32, u32, u32, Samples)> = Vec::new();
    let mut tone = ToneMap::default();

    match decoder.get_chunk_type() {
        ChunkType::Tile => {
            if layout.planar {
                return Err(DImgError::Unsupported("tiled TIFF with separated planes".into()));
            }
            let result = decoder.read_image()?;
            let samples = Samples::from_result(
                result,
                layout.bits,
                layout.width as usize * chunk_spp,
                layout.height as usize,
            )?;
            tone = ToneMap::from_max(samples.max_float());
            chunks.push((0, 0, layout.width, layout.height, samples));
        }
        ChunkType::Strip => {
            let strip_count = decoder.strip_count()?;
            let rows_per_strip = decoder.chunk_dimensions().1.max(1);
            let strips_per_plane = (strip_count / planes as u32).max(1);
            let progress = ctx.rows(strip_count, 0.8);
            let mut max = 0.0f32;

            for index in 0..strip_count {
                progress.checkpoint(index)?;
                let (chunk_width, rows) = decoder.chunk_data_dimensions(index);
                let result = decoder.read_chunk(index)?;
                let samples = Samples::from_result(
                    result,
                    layout.bits,
                    chunk_width as usize * chunk_spp,
                    rows as usize,
                )?;
                let plane = (index / strips_per_plane) as usize;
                let row0 = (index % strips_per_plane) * rows_per_strip;
                // Float strips wait for the global maximum.
                if let Samples::Float(_) = samples {
                    max = max.max(samples.max_float());
                    chunks.push((plane, row0, chunk_width, rows, samples));
                } else {
                    place(layout, data, tone, &samples, plane, row0, chunk_width, rows);
                }
            }
            if max > 0.0 {
                tone = ToneMap::from_max(max);
            }
        }
    }

    if !chunks.is_empty() && tone.factor > 1.0 {
        tracing::warn!(
            "TIFF floating point data tone mapped with factor {:.3}, exponent {}",
            tone.factor,
            tone.scale
        );
    }
    for (plane, row0, chunk_width, rows, samples) in &chunks {
        place(layout, data, tone, samples, *plane, *row0, *chunk_width, *rows);
    }
    ctx.report(0.9);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn place(
    layout: &Layout,
    data: &mut [u8],
    tone: ToneMap,
    samples: &Samples,
    plane: usize,
    row0: u32,
    chunk_width: u32,
    rows: u32,
) {
    let mut target = Target {
        layout,
        data,
        sixteen_bit: layout.sixteen_bit(),
        tone,
    };
    if layout.planar {
        target.put_plane(samples, plane, row0, rows);
    } else {
        target.put_interleaved(samples, row0, chunk_width, rows);
    }
}

/// Bytes of a BYTE, UNDEFINED or LONG field.
fn field_bytes(value: &Value, little_endian: bool) -> Option<Vec<u8>> {
    match value {
        Value::Byte(v) | Value::Undefined(v, _) => Some(v.clone()),
        Value::Long(v) => Some(
            v.iter()
                .flat_map(|x| if little_endian { x.to_le_bytes() } else { x.to_be_bytes() })
                .collect(),
        ),
        _ => None,
    }
}

/// ICC, XMP, IPTC and Exif from the first directory.
fn read_side_data(bytes: &[u8], image: &mut LoadedImage, ctx: &LoadContext<'_>) {
    let (fields, little_endian) = match exif::parse_exif(bytes) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!("TIFF directory not readable as Exif: {e}");
            return;
        }
    };
    let primary = |number: u16| {
        fields
            .iter()
            .find(|f| f.ifd_num == In::PRIMARY && f.tag.context() == Context::Tiff && f.tag.number() == number)
    };

    if ctx.wants(LoadFlags::ICC_DATA) {
        if let Some(icc) = primary(TAG_ICC).and_then(|f| field_bytes(&f.value, little_endian)) {
            image.icc = IccProfile::Embedded(icc);
        }
    }
    if !ctx.wants(LoadFlags::METADATA) {
        return;
    }

    if let Some(xmp) = primary(TAG_XMP).and_then(|f| field_bytes(&f.value, little_endian)) {
        if let Err(e) = image.metadata.load_xmp_packet(&xmp) {
            tracing::warn!("ignoring unreadable XMP packet: {e}");
        }
    }
    if let Some(iptc) = primary(TAG_IPTC).and_then(|f| field_bytes(&f.value, little_endian)) {
        image.metadata.set_iptc(iptc);
    }

    let exif: Vec<Field> = fields
        .into_iter()
        .filter(|f| f.ifd_num == In::PRIMARY)
        .filter(|f| f.tag.context() != Context::Tiff || DESCRIPTIVE_TAGS.contains(&f.tag.number()))
        .collect();
    if !exif.is_empty() {
        if let Err(e) = image.metadata.set_exif_fields(&exif, little_endian) {
            tracing::warn!("cannot rebuild Exif block from TIFF tags: {e}");
        }
    }
}

/// Sample type of an output strip.
trait Channel: Copy {
    fn from_level(level: u16) -> Self;
}

impl Channel for u8 {
    fn from_level(level: u16) -> Self {
        level as u8
    }
}

impl Channel for u16 {
    fn from_level(level: u16) -> Self {
        level
    }
}

fn write_image<C, T, W>(
    encoder: &mut TiffEncoder<W>,
    image: &DImg,
    ctx: &SaveContext<'_>,
) -> Result<()>
where
    C: EncoderColor<Inner = T>,
    T: Channel,
    [T]: TiffValue,
    W: Write + Seek,
{
    let (width, height) = image.size();
    let channels = if image.has_alpha() { 4 } else { 3 };
    let exif_fields = parse_exif_fields(image);

    // The Exif sub-directory goes first so IFD0 can point at it.
    let exif_offset = match exif_fields.as_ref() {
        Some(fields) if fields.iter().any(|f| f.tag.context() == Context::Exif) => {
            let mut dir = encoder.extra_directory()?;
            for field in fields.iter().filter(|f| f.tag.context() == Context::Exif) {
                write_field(&mut dir, field)?;
            }
            Some(dir.finish_with_offsets()?.offset)
        }
        _ => None,
    };

    let mut out = encoder.new_image::<C>(width, height)?;
    {
        let dir = out.encoder();
        dir.write_tag(Tag::Software, ctx.software.as_str())?;
        if let Some(fields) = exif_fields.as_ref() {
            for field in fields.iter().filter(|f| {
                f.tag.context() == Context::Tiff && DESCRIPTIVE_TAGS.contains(&f.tag.number())
            }) {
                write_field(dir, field)?;
            }
        }
        if let Some(offset) = exif_offset {
            dir.write_tag(Tag::ExifDirectory, Ifd(offset))?;
        }
        if let Some(icc) = image.icc_profile().data() {
            dir.write_tag(Tag::IccProfile, icc)?;
        }
        let xmp = image.metadata().xmp();
        if !xmp.is_empty() {
            dir.write_tag(Tag::Unknown(TAG_XMP), xmp.to_packet()?.as_bytes())?;
        }
        let iptc = image.metadata().iptc();
        if !iptc.is_empty() {
            dir.write_tag(Tag::Unknown(TAG_IPTC), iptc)?;
        }
    }

    let row_bytes = (width as usize * channels * std::mem::size_of::<T>()).max(1);
    let rows_per_strip = (STRIP_BYTES / row_bytes).clamp(1, height.max(1) as usize) as u32;
    out.rows_per_strip(rows_per_strip)?;

    let sixteen_bit = image.sixteen_bit();
    let bpp = image.bytes_depth();
    let progress = ctx.rows(height, 0.8);
    let mut strip = Vec::with_capacity(rows_per_strip as usize * width as usize * channels);
    let mut y = 0;
    while y < height {
        progress.checkpoint(y)?;
        strip.clear();
        let end = (y + rows_per_strip).min(height);
        for row in y..end {
            let Some(line) = image.scan_line(row) else { break };
            for px in line.chunks_exact(bpp) {
                let [r, g, b, a] = get_rgba(px, sixteen_bit);
                strip.extend_from_slice(&[T::from_level(r), T::from_level(g), T::from_level(b)]);
                if channels == 4 {
                    strip.push(T::from_level(a));
                }
            }
        }
        out.write_strip(&strip)?;
        y = end;
    }
    out.finish()?;
    Ok(())
}

fn parse_exif_fields(image: &DImg) -> Option<Vec<Field>> {
    let exif = image.metadata().exif();
    if exif.is_empty() {
        return None;
    }
    match exif::parse_exif(exif) {
        Ok((fields, _)) => Some(fields.into_iter().filter(|f| f.ifd_num == In::PRIMARY).collect()),
        Err(e) => {
            tracing::warn!("Exif block not written to TIFF: {e}");
            None
        }
    }
}

/// Write one Exif field as a TIFF tag. Values the encoder cannot express
/// (multi-valued rationals) are skipped.
fn write_field<W: Write + Seek, K: TiffKind>(
    dir: &mut DirectoryEncoder<'_, W, K>,
    field: &Field,
) -> Result<()> {
    let tag = Tag::from_u16_exhaustive(field.tag.number());
    match &field.value {
        Value::Ascii(values) => {
            if let Some(text) = values.first().and_then(|v| std::str::from_utf8(v).ok()) {
                dir.write_tag(tag, text)?;
            }
        }
        Value::Byte(v) | Value::Undefined(v, _) => dir.write_tag(tag, v.as_slice())?,
        Value::Short(v) => dir.write_tag(tag, v.as_slice())?,
        Value::Long(v) => dir.write_tag(tag, v.as_slice())?,
        Value::SShort(v) => dir.write_tag(tag, v.as_slice())?,
        Value::SLong(v) => dir.write_tag(tag, v.as_slice())?,
        Value::Float(v) => dir.write_tag(tag, v.as_slice())?,
        Value::Double(v) => dir.write_tag(tag, v.as_slice())?,
        Value::Rational(v) if v.len() == 1 => dir.write_tag(
            tag,
            Rational {
                n: v[0].num,
                d: v[0].denom,
            },
        )?,
        Value::SRational(v) if v.len() == 1 => dir.write_tag(
            tag,
            SRational {
                n: v[0].num,
                d: v[0].denom,
            },
        )?,
        other => tracing::debug!("skipping Exif tag {} with value {other:?}", field.tag),
    }
    Ok(())
}
