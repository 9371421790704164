//! Transparent gzip decompression.
//!
//! A handle opened with [`OpenFlags::DECOMPRESS`](crate::fs::OpenFlags) whose stream
//! starts with the gzip magic is wrapped here. The DEFLATE core is `miniz_oxide`; this
//! module owns the stream framing and the offset bookkeeping.
//!
//! One global decompression state is shared by all wrapped handles, trading random
//! access for a fixed memory budget (the 32 KB DEFLATE dictionary). A read from a
//! different handle, or from an offset before the current output position, resets the
//! state and decompression restarts from the beginning of the stream.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use miniz_oxide::inflate::stream::{inflate, InflateState};
use miniz_oxide::{DataFormat, MZError, MZFlush, MZStatus};
use spin::Mutex;

use crate::errors::{FsResult, Status};
use crate::fs::{FsHandle, HandleKind, HandlePayload, OpenFlags};

/// gzip member magic.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// gzip compression method: DEFLATE.
const GZIP_METHOD_DEFLATE: u8 = 8;

const FLAG_FHCRC: u8 = 1 << 1;
const FLAG_FEXTRA: u8 = 1 << 2;
const FLAG_FNAME: u8 = 1 << 3;
const FLAG_FCOMMENT: u8 = 1 << 4;

/// Payload of a decompression wrapper handle.
pub(crate) struct DecompressPayload {
    /// The compressed stream underneath.
    pub inner: Arc<FsHandle>,
    /// File offset of the first DEFLATE byte, past the gzip header.
    pub data_offset: u64,
}

/// Checks whether the stream begins with the gzip magic.
pub(crate) fn is_gzip(handle: &Arc<FsHandle>) -> FsResult<bool> {
    let mut magic = [0u8; 2];
    if handle.size < 18 {
        // Smaller than an empty gzip member.
        return Ok(false);
    }

    crate::fs::read(handle, &mut magic, 0)?;
    Ok(magic == GZIP_MAGIC)
}

/// Wraps `inner` in a decompression handle.
///
/// The wrapper's size is the `ISIZE` field of the gzip trailer: the uncompressed
/// length modulo 2^32.
pub(crate) fn open_wrapped(inner: &Arc<FsHandle>) -> FsResult<Arc<FsHandle>> {
    let data_offset = parse_header(inner)?;

    let mut trailer = [0u8; 4];
    crate::fs::read(inner, &mut trailer, inner.size - 4)?;
    let isize = u32::from_le_bytes(trailer);

    Ok(Arc::new(FsHandle {
        mount: inner.mount.clone(),
        kind: HandleKind::Regular,
        size: u64::from(isize),
        flags: OpenFlags::DECOMPRESS,
        id: super::NEXT_HANDLE_ID.fetch_add(1, core::sync::atomic::Ordering::Relaxed),
        payload: HandlePayload::Decompress(DecompressPayload {
            inner: inner.clone(),
            data_offset,
        }),
    }))
}

/// Walks the gzip member header and returns the offset of the DEFLATE data.
fn parse_header(inner: &Arc<FsHandle>) -> FsResult<u64> {
    let mut fixed = [0u8; 10];
    if crate::fs::read(inner, &mut fixed, 0)? != 10 {
        return Err(Status::CorruptFs);
    }

    if fixed[..2] != GZIP_MAGIC || fixed[2] != GZIP_METHOD_DEFLATE {
        return Err(Status::CorruptFs);
    }

    let flags = fixed[3];
    let mut offset = 10u64;

    if flags & FLAG_FEXTRA != 0 {
        let mut xlen = [0u8; 2];
        crate::fs::read(inner, &mut xlen, offset)?;
        offset += 2 + u64::from(u16::from_le_bytes(xlen));
    }

    for flag in [FLAG_FNAME, FLAG_FCOMMENT] {
        if flags & flag != 0 {
            offset = skip_cstring(inner, offset)?;
        }
    }

    if flags & FLAG_FHCRC != 0 {
        offset += 2;
    }

    if offset >= inner.size {
        return Err(Status::CorruptFs);
    }

    Ok(offset)
}

fn skip_cstring(inner: &Arc<FsHandle>, mut offset: u64) -> FsResult<u64> {
    let mut byte = [0u8; 1];
    loop {
        if crate::fs::read(inner, &mut byte, offset)? != 1 {
            return Err(Status::CorruptFs);
        }
        offset += 1;
        if byte[0] == 0 {
            return Ok(offset);
        }
    }
}

const IN_CHUNK: usize = 4096;
const OUT_CHUNK: usize = 4096;

struct GzState {
    /// Handle currently owning the global state.
    owner: u64,
    inflate: Box<InflateState>,
    /// Next compressed byte to feed, as a file offset on the inner handle.
    in_pos: u64,
    /// Uncompressed bytes produced so far.
    out_pos: u64,
    /// Leftover input bytes fetched but not yet consumed by the inflater.
    pending: Vec<u8>,
}

static GZ_STATE: Mutex<Option<GzState>> = Mutex::new(None);

/// Reads uncompressed bytes at `offset` from a wrapped handle.
///
/// Decompression only moves forward: the state is reset when the owner changes or the
/// offset moves backwards, and bytes below `offset` are produced and discarded.
pub(crate) fn read(
    handle: &Arc<FsHandle>,
    payload: &DecompressPayload,
    buf: &mut [u8],
    offset: u64,
) -> FsResult<usize> {
    if offset >= handle.size || buf.is_empty() {
        return Ok(0);
    }

    let want = buf.len().min((handle.size - offset) as usize);
    let buf = &mut buf[..want];

    let mut guard = GZ_STATE.lock();

    let needs_reset = match guard.as_ref() {
        Some(state) => state.owner != handle.id() || offset < state.out_pos,
        None => true,
    };
    if needs_reset {
        *guard = Some(GzState {
            owner: handle.id(),
            inflate: InflateState::new_boxed(DataFormat::Raw),
            in_pos: payload.data_offset,
            out_pos: 0,
            pending: Vec::new(),
        });
    }

    let state = guard.as_mut().expect("state initialised above");

    let result = decompress_into(state, payload, buf, offset);
    if result.is_err() {
        // Failure reinitialises: the next read restarts from a clean state.
        *guard = None;
    }

    result
}

fn decompress_into(
    state: &mut GzState,
    payload: &DecompressPayload,
    buf: &mut [u8],
    offset: u64,
) -> FsResult<usize> {
    let mut copied = 0usize;
    let mut out = [0u8; OUT_CHUNK];

    while copied < buf.len() {
        if state.pending.is_empty() {
            let mut chunk = alloc::vec![0u8; IN_CHUNK];
            let got = crate::fs::read(&payload.inner, &mut chunk, state.in_pos)?;
            if got == 0 {
                // Compressed stream exhausted before the trailer said it should be.
                return Err(Status::CorruptFs);
            }
            chunk.truncate(got);
            state.in_pos += got as u64;
            state.pending = chunk;
        }

        let result = inflate(&mut state.inflate, &state.pending, &mut out, MZFlush::None);
        state.pending.drain(..result.bytes_consumed);

        let produced = result.bytes_written;
        if produced > 0 {
            // Copy the part of this chunk that lands in the requested window.
            let chunk_start = state.out_pos;
            let chunk_end = chunk_start + produced as u64;
            let copy_from = offset + copied as u64;

            if chunk_end > copy_from {
                let in_chunk = (copy_from.max(chunk_start) - chunk_start) as usize;
                let take = (produced - in_chunk).min(buf.len() - copied);
                buf[copied..copied + take].copy_from_slice(&out[in_chunk..in_chunk + take]);
                copied += take;
            }

            state.out_pos = chunk_end;
        }

        match result.status {
            Ok(MZStatus::Ok) => {
                // A full stall with input available means the stream is broken.
                if result.bytes_consumed == 0 && produced == 0 {
                    return Err(Status::CorruptFs);
                }
            }
            Ok(MZStatus::StreamEnd) => break,
            Ok(_) => return Err(Status::Io),
            Err(MZError::Buf) => {
                // The inflater wants more input than the buffered tail holds.
                if result.bytes_consumed == 0 && produced == 0 {
                    let mut chunk = alloc::vec![0u8; IN_CHUNK];
                    let got = crate::fs::read(&payload.inner, &mut chunk, state.in_pos)?;
                    if got == 0 {
                        return Err(Status::CorruptFs);
                    }
                    state.pending.extend_from_slice(&chunk[..got]);
                    state.in_pos += got as u64;
                }
            }
            Err(_) => return Err(Status::CorruptFs),
        }
    }

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceRegistry;
    use crate::fs::testfs::{self, TestTree};
    use crate::fs::{open, HandleKind, OpenContext, OpenFlags};

    /// Builds a gzip member around `data`, with optional FNAME field.
    pub(crate) fn gzip_wrap(data: &[u8], name: Option<&[u8]>) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&GZIP_MAGIC);
        out.push(GZIP_METHOD_DEFLATE);
        out.push(if name.is_some() { FLAG_FNAME } else { 0 });
        out.extend_from_slice(&[0; 4]); // mtime
        out.push(0); // xfl
        out.push(255); // os: unknown

        if let Some(name) = name {
            out.extend_from_slice(name);
            out.push(0);
        }

        out.extend_from_slice(&miniz_oxide::deflate::compress_to_vec(data, 6));
        out.extend_from_slice(&crate::device::partitions::gpt::crc32(data).to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out
    }

    fn sample_data(len: usize) -> Vec<u8> {
        // Compressible but position-dependent content.
        (0..len)
            .map(|i| ((i / 7) ^ (i / 256) ^ (i % 13)) as u8)
            .collect()
    }

    fn wrapped_handle(data: &[u8]) -> (Arc<FsHandle>, DeviceRegistry) {
        let tree = TestTree::dir(&[("blob.gz", TestTree::file(&gzip_wrap(data, Some(b"blob"))))]);

        let mut registry = DeviceRegistry::new();
        let device = testfs::mount_tree(&mut registry, "gzt0", tree, false);

        let cx = OpenContext {
            registry: Some(&registry),
            device: Some(device),
            directory: None,
        };
        let handle = open(
            &cx,
            "/blob.gz",
            Some(HandleKind::Regular),
            OpenFlags::DECOMPRESS,
        )
        .unwrap();
        (handle, registry)
    }

    #[test]
    fn wrapper_size_is_the_trailer_isize() {
        let data = sample_data(100 * 1024);
        let (handle, _registry) = wrapped_handle(&data);
        assert_eq!(handle.size, data.len() as u64);
    }

    #[test]
    fn forward_and_backward_reads_are_transparent() {
        let data = sample_data(100 * 1024);
        let (handle, _registry) = wrapped_handle(&data);

        let mut buf = [0u8; 4096];
        assert_eq!(crate::fs::read(&handle, &mut buf, 90_000).unwrap(), 4096);
        assert_eq!(&buf[..], &data[90_000..94_096]);

        // Backward seek forces a transparent state reset.
        assert_eq!(crate::fs::read(&handle, &mut buf, 10_000).unwrap(), 4096);
        assert_eq!(&buf[..], &data[10_000..14_096]);
    }

    #[test]
    fn covering_reads_reconstruct_the_content() {
        let data = sample_data(40 * 1024);
        let (handle, _registry) = wrapped_handle(&data);

        // Out-of-order, overlapping windows whose union covers the file.
        let windows = [
            (30 * 1024, 10 * 1024),
            (0, 8 * 1024),
            (6 * 1024, 10 * 1024),
            (14 * 1024, 20 * 1024),
        ];

        let mut rebuilt = alloc::vec![0u8; data.len()];
        let mut seen = alloc::vec![false; data.len()];
        for (offset, len) in windows {
            let mut buf = alloc::vec![0u8; len];
            assert_eq!(crate::fs::read(&handle, &mut buf, offset as u64).unwrap(), len);
            for i in 0..len {
                if !seen[offset + i] {
                    rebuilt[offset + i] = buf[i];
                    seen[offset + i] = true;
                }
            }
        }

        assert!(seen.iter().all(|&s| s));
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn reads_past_the_end_are_clamped() {
        let data = sample_data(1000);
        let (handle, _registry) = wrapped_handle(&data);

        let mut buf = [0u8; 64];
        assert_eq!(crate::fs::read(&handle, &mut buf, 980).unwrap(), 20);
        assert_eq!(&buf[..20], &data[980..]);
        assert_eq!(crate::fs::read(&handle, &mut buf, 1000).unwrap(), 0);
    }

    #[test]
    fn two_handles_share_the_single_state() {
        let data_a = sample_data(8 * 1024);
        let data_b: Vec<u8> = sample_data(8 * 1024).iter().map(|b| b ^ 0xAA).collect();

        let tree = TestTree::dir(&[
            ("a.gz", TestTree::file(&gzip_wrap(&data_a, None))),
            ("b.gz", TestTree::file(&gzip_wrap(&data_b, None))),
        ]);
        let mut registry = DeviceRegistry::new();
        let device = testfs::mount_tree(&mut registry, "gzt1", tree, false);
        let cx = OpenContext {
            registry: Some(&registry),
            device: Some(device),
            directory: None,
        };

        let a = open(&cx, "/a.gz", None, OpenFlags::DECOMPRESS).unwrap();
        let b = open(&cx, "/b.gz", None, OpenFlags::DECOMPRESS).unwrap();

        // Interleaved reads: each switch resets the shared state, results stay right.
        let mut buf_a = [0u8; 512];
        let mut buf_b = [0u8; 512];
        crate::fs::read(&a, &mut buf_a, 4096).unwrap();
        crate::fs::read(&b, &mut buf_b, 4096).unwrap();
        assert_eq!(&buf_a[..], &data_a[4096..4608]);
        assert_eq!(&buf_b[..], &data_b[4096..4608]);
    }

    #[test]
    fn plain_files_are_not_wrapped() {
        let tree = TestTree::dir(&[("plain", TestTree::file(b"just bytes, no magic here..."))]);
        let mut registry = DeviceRegistry::new();
        let device = testfs::mount_tree(&mut registry, "gzt2", tree, false);
        let cx = OpenContext {
            registry: Some(&registry),
            device: Some(device),
            directory: None,
        };

        let handle = open(&cx, "/plain", None, OpenFlags::DECOMPRESS).unwrap();
        assert_eq!(read_back(&handle), b"just bytes, no magic here...");
    }

    fn read_back(handle: &Arc<FsHandle>) -> Vec<u8> {
        crate::fs::read_whole(handle).unwrap()
    }
}
