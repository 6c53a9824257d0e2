//! Versioned, chunked image format for lungs and bodies.
//!
//! Layout: `MAGIC`, `u32` version, then a sequence of tagged chunks. Every
//! chunk is LZ4-compressed and carries its uncompressed length. Readers skip
//! tags they do not know.

use std::io::{self, Cursor, Read, Write};

use crate::dark_matter::DarkMatter;
use crate::lung::{ExecutionTier, Lung, LungConfig};
use crate::tensor::{self, HeadProjection, Tensors};

pub const MAGIC: &[u8; 8] = b"LUNGIMG1";
pub const VERSION_V1: u32 = 1;
pub const VERSION_CURRENT: u32 = VERSION_V1;

pub const TAG_CONFIG: [u8; 4] = *b"CFG0";
pub const TAG_WEIGHTS: [u8; 4] = *b"WGTS";
pub const TAG_RESONANCE: [u8; 4] = *b"RESO";
pub const TAG_KNOBS: [u8; 4] = *b"KNOB";
pub const TAG_STATS: [u8; 4] = *b"STAT";
pub const TAG_DARK: [u8; 4] = *b"DARK";

pub fn compress_lz4(input: &[u8]) -> Vec<u8> {
    lz4_flex::compress(input)
}

pub fn decompress_lz4(input: &[u8], expected_size: usize) -> io::Result<Vec<u8>> {
    lz4_flex::decompress(input, expected_size)
        .map_err(|_| invalid("lz4 decompression failed"))
}

pub(crate) fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Byte sink that only measures.
#[derive(Debug, Default)]
pub struct CountingWriter {
    written: usize,
}

impl CountingWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written = self.written.saturating_add(buf.len());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Image sink with a hard byte budget. A write that would cross the budget
/// fails with `WriteZero` and leaves the sink untouched.
pub struct BoundedWriter<W> {
    inner: W,
    limit: usize,
    written: usize,
}

impl<W: Write> BoundedWriter<W> {
    pub fn new(inner: W, limit: usize) -> Self {
        Self {
            inner,
            limit,
            written: 0,
        }
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn headroom(&self) -> usize {
        self.limit - self.written
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for BoundedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.len() > self.headroom() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("image would exceed the {} byte budget", self.limit),
            ));
        }
        let n = self.inner.write(buf)?;
        self.written += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

// ---------------------------------------------------------------------------
// Primitive codecs
// ---------------------------------------------------------------------------

pub fn write_u8<W: Write>(w: &mut W, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

pub fn write_u32_le<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_u64_le<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_f32_le<W: Write>(w: &mut W, v: f32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

/// Length-prefixed `f32` array.
pub fn write_f32_slice<W: Write>(w: &mut W, xs: &[f32]) -> io::Result<()> {
    write_u32_le(w, len_u32(xs.len())?)?;
    for &x in xs {
        write_f32_le(w, x)?;
    }
    Ok(())
}

pub fn read_exact<const N: usize, R: Read>(r: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    Ok(read_exact::<1, _>(r)?[0])
}

pub fn read_u32_le<R: Read>(r: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_exact::<4, _>(r)?))
}

pub fn read_u64_le<R: Read>(r: &mut R) -> io::Result<u64> {
    Ok(u64::from_le_bytes(read_exact::<8, _>(r)?))
}

pub fn read_f32_le<R: Read>(r: &mut R) -> io::Result<f32> {
    Ok(f32::from_le_bytes(read_exact::<4, _>(r)?))
}

/// Read a length-prefixed `f32` array, rejecting lengths the payload cannot hold.
pub fn read_f32_vec(cur: &mut Cursor<Vec<u8>>) -> io::Result<Vec<f32>> {
    let n = read_u32_le(cur)? as usize;
    if n.saturating_mul(4) > remaining(cur) {
        return Err(invalid("array length exceeds chunk"));
    }
    (0..n).map(|_| read_f32_le(cur)).collect()
}

pub(crate) fn remaining(cur: &Cursor<Vec<u8>>) -> usize {
    cur.get_ref().len().saturating_sub(cur.position() as usize)
}

pub(crate) fn len_u32(n: usize) -> io::Result<u32> {
    u32::try_from(n).map_err(|_| invalid("length does not fit in u32"))
}

// ---------------------------------------------------------------------------
// Chunks
// ---------------------------------------------------------------------------

/// Write an LZ4 chunk.
///
/// Layout:
/// - tag: [u8;4]
/// - len: u32 (bytes following, including the 4-byte uncompressed length)
/// - uncompressed_len: u32
/// - compressed payload bytes
pub fn write_chunk_lz4<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> io::Result<()> {
    let compressed = compress_lz4(payload);
    let total_len = 4u32.saturating_add(len_u32(compressed.len())?);
    w.write_all(&tag)?;
    write_u32_le(w, total_len)?;
    write_u32_le(w, len_u32(payload.len())?)?;
    w.write_all(&compressed)
}

pub fn read_chunk_header<R: Read>(r: &mut R) -> io::Result<([u8; 4], u32)> {
    let tag = read_exact::<4, _>(r)?;
    let len = read_u32_le(r)?;
    Ok((tag, len))
}

/// Read one chunk body of `len` bytes and return its decompressed payload.
fn read_chunk_payload<R: Read>(r: &mut R, len: u32) -> io::Result<Vec<u8>> {
    let mut take = r.take(len as u64);
    let uncompressed_len = read_u32_le(&mut take)? as usize;
    let mut compressed = Vec::with_capacity((len as usize).saturating_sub(4));
    take.read_to_end(&mut compressed)?;
    let payload = decompress_lz4(&compressed, uncompressed_len)?;
    io::copy(&mut take, &mut io::sink())?;
    Ok(payload)
}

pub(crate) fn write_header<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_all(MAGIC)?;
    write_u32_le(w, VERSION_CURRENT)
}

fn read_header<R: Read>(r: &mut R) -> io::Result<()> {
    let magic = read_exact::<8, _>(r)?;
    if &magic != MAGIC {
        return Err(invalid("bad lung image magic"));
    }
    if read_u32_le(r)? != VERSION_CURRENT {
        return Err(invalid("unsupported lung image version"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Lung payloads
// ---------------------------------------------------------------------------

fn tier_code(t: ExecutionTier) -> u8 {
    match t {
        ExecutionTier::Scalar => 0,
        ExecutionTier::Simd => 1,
        ExecutionTier::Parallel => 2,
    }
}

fn tier_from_code(c: u8) -> ExecutionTier {
    match c {
        1 => ExecutionTier::Simd,
        2 => ExecutionTier::Parallel,
        _ => ExecutionTier::Scalar,
    }
}

fn write_config_payload(cfg: &LungConfig, out: &mut Vec<u8>) -> io::Result<()> {
    write_u32_le(out, len_u32(cfg.vocab_size)?)?;
    write_u32_le(out, len_u32(cfg.d_model)?)?;
    write_u32_le(out, len_u32(cfg.ctx_len)?)?;
    write_u32_le(out, len_u32(cfg.n_heads)?)?;
    write_u8(out, cfg.seed.is_some() as u8)?;
    write_u64_le(out, cfg.seed.unwrap_or(0))?;
    write_f32_le(out, cfg.learning_rate)?;
    write_f32_le(out, cfg.attend_focus)?;
    write_f32_le(out, cfg.attend_spread)?;
    write_f32_le(out, cfg.temporal_alpha)?;
    write_u8(out, cfg.use_rtl as u8)?;
    write_u8(out, tier_code(cfg.execution_tier))
}

fn read_config_payload(cur: &mut Cursor<Vec<u8>>) -> io::Result<LungConfig> {
    let vocab_size = read_u32_le(cur)? as usize;
    let d_model = read_u32_le(cur)? as usize;
    let ctx_len = read_u32_le(cur)? as usize;
    let n_heads = read_u32_le(cur)? as usize;
    let has_seed = read_u8(cur)? != 0;
    let seed = read_u64_le(cur)?;
    let cfg = LungConfig {
        vocab_size,
        d_model,
        ctx_len,
        n_heads,
        seed: has_seed.then_some(seed),
        learning_rate: read_f32_le(cur)?,
        attend_focus: read_f32_le(cur)?,
        attend_spread: read_f32_le(cur)?,
        temporal_alpha: read_f32_le(cur)?,
        use_rtl: read_u8(cur)? != 0,
        execution_tier: tier_from_code(read_u8(cur)?),
    };
    cfg.validate()
        .map_err(|_| invalid("CFG0 describes an invalid lung"))?;
    Ok(cfg)
}

fn write_weights_payload(t: &Tensors, out: &mut Vec<u8>) -> io::Result<()> {
    write_f32_slice(out, &t.embeddings)?;
    write_f32_slice(out, &t.wo)?;
    write_u32_le(out, len_u32(t.heads.len())?)?;
    for h in &t.heads {
        write_f32_slice(out, &h.wq)?;
        write_f32_slice(out, &h.wk)?;
        write_f32_slice(out, &h.wv)?;
    }
    Ok(())
}

struct RawWeights {
    embeddings: Vec<f32>,
    wo: Vec<f32>,
    heads: Vec<HeadProjection>,
}

fn read_weights_payload(cur: &mut Cursor<Vec<u8>>) -> io::Result<RawWeights> {
    let embeddings = read_f32_vec(cur)?;
    let wo = read_f32_vec(cur)?;
    let n_heads = read_u32_le(cur)? as usize;
    if n_heads.saturating_mul(12) > remaining(cur) {
        return Err(invalid("WGTS head count exceeds chunk"));
    }
    let mut heads = Vec::with_capacity(n_heads);
    for _ in 0..n_heads {
        heads.push(HeadProjection {
            wq: read_f32_vec(cur)?,
            wk: read_f32_vec(cur)?,
            wv: read_f32_vec(cur)?,
        });
    }
    Ok(RawWeights {
        embeddings,
        wo,
        heads,
    })
}

fn assemble_tensors(cfg: &LungConfig, w: RawWeights) -> io::Result<Tensors> {
    let d = cfg.d_model;
    let head_dim = cfg.head_dim();
    if w.embeddings.len() != cfg.vocab_size * d || w.wo.len() != d * cfg.vocab_size {
        return Err(invalid("WGTS matrix size mismatch"));
    }
    if w.heads.len() != cfg.n_heads {
        return Err(invalid("WGTS head count mismatch"));
    }
    let head_size = head_dim * d;
    if w
        .heads
        .iter()
        .any(|h| h.wq.len() != head_size || h.wk.len() != head_size || h.wv.len() != head_size)
    {
        return Err(invalid("WGTS head size mismatch"));
    }
    Ok(Tensors {
        vocab_size: cfg.vocab_size,
        d_model: d,
        ctx_len: cfg.ctx_len,
        n_heads: cfg.n_heads,
        head_dim,
        embeddings: w.embeddings,
        pos_ltr: tensor::build_positional_encoding(cfg.ctx_len, d, false),
        pos_rtl: tensor::build_positional_encoding(cfg.ctx_len, d, true),
        wo: w.wo,
        heads: w.heads,
    })
}

/// Write every lung chunk (no header).
pub(crate) fn write_lung_chunks<W: Write>(lung: &Lung, w: &mut W) -> io::Result<()> {
    let mut payload = Vec::new();
    write_config_payload(&lung.cfg, &mut payload)?;
    write_chunk_lz4(w, TAG_CONFIG, &payload)?;

    payload.clear();
    write_weights_payload(&lung.tensors, &mut payload)?;
    write_chunk_lz4(w, TAG_WEIGHTS, &payload)?;

    payload.clear();
    write_f32_slice(&mut payload, &lung.resonance)?;
    write_f32_slice(&mut payload, &lung.presence)?;
    write_chunk_lz4(w, TAG_RESONANCE, &payload)?;

    payload.clear();
    write_f32_le(&mut payload, lung.attend_focus)?;
    write_f32_le(&mut payload, lung.attend_spread)?;
    write_f32_le(&mut payload, lung.temporal_alpha)?;
    write_u8(&mut payload, lung.use_rtl as u8)?;
    write_chunk_lz4(w, TAG_KNOBS, &payload)?;

    payload.clear();
    write_u64_le(&mut payload, lung.forward_count)?;
    write_u64_le(&mut payload, lung.train_steps)?;
    write_f32_le(&mut payload, lung.last_entropy)?;
    write_chunk_lz4(w, TAG_STATS, &payload)
}

/// Read a full image. The dark-matter chunk is optional.
pub(crate) fn read_image<R: Read>(r: &mut R) -> io::Result<(Lung, Option<DarkMatter>)> {
    read_header(r)?;

    let mut cfg: Option<LungConfig> = None;
    let mut weights: Option<RawWeights> = None;
    let mut reso: Option<(Vec<f32>, Vec<f32>)> = None;
    let mut knobs: Option<(f32, f32, f32, bool)> = None;
    let mut stats: Option<(u64, u64, f32)> = None;
    let mut dark: Option<DarkMatter> = None;

    loop {
        let (tag, len) = match read_chunk_header(r) {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        let mut cur = Cursor::new(read_chunk_payload(r, len)?);
        match tag {
            TAG_CONFIG => cfg = Some(read_config_payload(&mut cur)?),
            TAG_WEIGHTS => weights = Some(read_weights_payload(&mut cur)?),
            TAG_RESONANCE => reso = Some((read_f32_vec(&mut cur)?, read_f32_vec(&mut cur)?)),
            TAG_KNOBS => {
                knobs = Some((
                    read_f32_le(&mut cur)?,
                    read_f32_le(&mut cur)?,
                    read_f32_le(&mut cur)?,
                    read_u8(&mut cur)? != 0,
                ))
            }
            TAG_STATS => {
                stats = Some((
                    read_u64_le(&mut cur)?,
                    read_u64_le(&mut cur)?,
                    read_f32_le(&mut cur)?,
                ))
            }
            TAG_DARK => dark = Some(DarkMatter::read_image_payload(&mut cur)?),
            _ => {
                // Unknown chunk: skipped.
            }
        }
    }

    let cfg = cfg.ok_or_else(|| invalid("missing CFG0"))?;
    let weights = weights.ok_or_else(|| invalid("missing WGTS"))?;
    let (resonance, presence) = reso.ok_or_else(|| invalid("missing RESO"))?;
    if resonance.len() != cfg.vocab_size || presence.len() != cfg.vocab_size {
        return Err(invalid("RESO length mismatch"));
    }
    if !resonance.iter().chain(&presence).all(|v| (0.0..=1.0).contains(v)) {
        return Err(invalid("RESO values outside [0, 1]"));
    }
    let tensors = assemble_tensors(&cfg, weights)?;

    let mut lung = Lung::from_parts(cfg, tensors, resonance, presence);
    if let Some((focus, spread, alpha, rtl)) = knobs {
        lung.set_focus(focus);
        lung.set_spread(spread);
        lung.set_temporal_alpha(alpha);
        lung.set_rtl(rtl);
    }
    if let Some((forwards, steps, entropy)) = stats {
        lung.forward_count = forwards;
        lung.train_steps = steps;
        lung.last_entropy = entropy;
    }
    Ok((lung, dark))
}

impl Lung {
    /// Serialize a versioned, chunked lung image.
    ///
    /// The activation cache and last-inference getters are not persisted; a
    /// loaded lung needs a forward call before it can train.
    pub fn save_image_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_header(w)?;
        write_lung_chunks(self, w)
    }

    /// Load a lung image. Unknown chunks (including `DARK`) are skipped.
    pub fn load_image_from<R: Read>(r: &mut R) -> io::Result<Self> {
        read_image(r).map(|(lung, _)| lung)
    }

    /// Exact serialized size in bytes of the current image.
    pub fn image_size_bytes(&self) -> io::Result<usize> {
        let mut cw = CountingWriter::new();
        self.save_image_to(&mut cw)?;
        Ok(cw.written())
    }

    pub fn save_image_bytes(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.save_image_to(&mut buf)?;
        Ok(buf)
    }

    pub fn load_image_bytes(bytes: &[u8]) -> io::Result<Self> {
        Self::load_image_from(&mut Cursor::new(bytes))
    }
}
