//! Helpers for the segment arrays logical entries carry.

use crate::lower::MrHandle;

/// Byte cursor into a segment array: index of the current segment plus a
/// byte offset within it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IovCursor {
    pub index: usize,
    pub offset: usize,
}

pub fn total_len(segs: &[Vec<u8>]) -> usize {
    segs.iter().map(|s| s.len()).sum()
}

/// Copies out of `segs` starting at absolute byte `offset`, returning the
/// number of bytes written into `dst`.
pub fn copy_from_iov(dst: &mut [u8], segs: &[Vec<u8>], mut offset: usize) -> usize {
    let mut done = 0;
    for seg in segs {
        if offset >= seg.len() {
            offset -= seg.len();
            continue;
        }
        let avail = &seg[offset..];
        let n = avail.len().min(dst.len() - done);
        dst[done..done + n].copy_from_slice(&avail[..n]);
        done += n;
        offset = 0;
        if done == dst.len() {
            break;
        }
    }
    done
}

/// Copies `src` into `segs` at absolute byte `offset`, returning the
/// number of bytes written.
pub fn copy_to_iov(segs: &mut [Vec<u8>], mut offset: usize, src: &[u8]) -> usize {
    let mut done = 0;
    for seg in segs {
        if offset >= seg.len() {
            offset -= seg.len();
            continue;
        }
        let n = (seg.len() - offset).min(src.len() - done);
        seg[offset..offset + n].copy_from_slice(&src[done..done + n]);
        done += n;
        offset = 0;
        if done == src.len() {
            break;
        }
    }
    done
}

/// Positions `cursor` at absolute byte `offset` into `segs`.
pub fn seek(segs: &[Vec<u8>], cursor: &mut IovCursor, mut offset: usize) {
    for (index, seg) in segs.iter().enumerate() {
        if offset < seg.len() {
            cursor.index = index;
            cursor.offset = offset;
            return;
        }
        offset -= seg.len();
    }
    cursor.index = segs.len();
    cursor.offset = 0;
}

/// Copies consecutive unregistered segments into `dst` through the cursor,
/// stopping at the first registered segment or at `limit` bytes. Mirrors
/// the staging-buffer coalescing of small segments.
pub fn copy_from_cursor(
    dst: &mut [u8],
    segs: &[Vec<u8>],
    mr: &[Option<MrHandle>],
    cursor: &mut IovCursor,
    limit: usize,
) -> usize {
    let mut done = 0;
    while cursor.index < segs.len() && done < limit {
        if mr.get(cursor.index).map_or(false, |m| m.is_some()) {
            break;
        }
        let seg = &segs[cursor.index];
        let remaining = seg.len() - cursor.offset;
        let n = remaining.min(limit - done);
        dst[done..done + n].copy_from_slice(&seg[cursor.offset..cursor.offset + n]);
        done += n;
        if n == remaining {
            cursor.index += 1;
            cursor.offset = 0;
        } else {
            cursor.offset += n;
            break;
        }
    }
    done
}
