use std::io::{Read, Write};
use std::path::Path;

use sha1::{Digest, Sha1};

pub const DEFAULT_PIECE_SIZE: usize = 256 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("piece {0} missing, cannot join")]
    MissingPiece(usize),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Reads `path` in `piece_size`-byte chunks, hashing each with SHA-1. The
/// final chunk keeps its actual (possibly short) length.
pub fn split<P: AsRef<Path>>(path: P, piece_size: usize) -> Result<(Vec<Vec<u8>>, Vec<[u8; 20]>)> {
    let piece_size = if piece_size == 0 { DEFAULT_PIECE_SIZE } else { piece_size };
    let mut file = std::fs::File::open(path)?;

    let mut pieces = Vec::new();
    let mut buf = vec![0u8; piece_size];
    loop {
        let n = read_full(&mut file, &mut buf)?;
        if n == 0 {
            break;
        }
        pieces.push(buf[..n].to_vec());
        if n < piece_size {
            break;
        }
    }

    let hashes = pieces
        .iter()
        .map(|p| {
            let mut hasher = Sha1::new();
            hasher.update(p);
            hasher.finalize().into()
        })
        .collect();

    Ok((pieces, hashes))
}

// io::Read::read can return short reads before EOF; loop until the buffer
// is full or the file is exhausted, mirroring io.ReadFull's semantics.
fn read_full(file: &mut std::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..])? {
            0 => break,
            n => total += n,
        }
    }
    Ok(total)
}

/// Writes `pieces` in index order to `out_path`, creating the destination
/// directory and truncating any existing file. Fails if any piece index is
/// missing.
pub fn join<P: AsRef<Path>>(pieces: &[Option<Vec<u8>>], out_path: P) -> Result<()> {
    let out_path = out_path.as_ref();
    if let Some(parent) = out_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut file = std::fs::File::create(out_path)?;
    for (idx, piece) in pieces.iter().enumerate() {
        let piece = piece.as_ref().ok_or(StoreError::MissingPiece(idx))?;
        file.write_all(piece)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn split_short_last_piece() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.txt");
        std::fs::write(&path, "A".repeat(1000)).unwrap();

        let (pieces, hashes) = split(&path, 256).unwrap();
        assert_eq!(pieces.len(), 4);
        assert_eq!(pieces[0].len(), 256);
        assert_eq!(pieces[1].len(), 256);
        assert_eq!(pieces[2].len(), 256);
        assert_eq!(pieces[3].len(), 232);
        assert_eq!(hashes.len(), 4);

        let mut hasher = Sha1::new();
        hasher.update(&pieces[3]);
        let expected: [u8; 20] = hasher.finalize().into();
        assert_eq!(hashes[3], expected);
    }

    #[test]
    fn split_exact_multiple() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.txt");
        std::fs::write(&path, "B".repeat(512)).unwrap();

        let (pieces, _) = split(&path, 256).unwrap();
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].len(), 256);
        assert_eq!(pieces[1].len(), 256);
    }

    #[test]
    fn join_roundtrip_byte_identical() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("in.bin");
        let data: Vec<u8> = (0..2000).map(|i| (i % 251) as u8).collect();
        std::fs::write(&src, &data).unwrap();

        let (pieces, _) = split(&src, 256).unwrap();
        let wrapped: Vec<Option<Vec<u8>>> = pieces.into_iter().map(Some).collect();

        let out = dir.path().join("nested").join("out.bin");
        join(&wrapped, &out).unwrap();

        let roundtripped = std::fs::read(&out).unwrap();
        assert_eq!(roundtripped, data);
    }

    #[test]
    fn join_fails_on_missing_piece() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out.bin");
        let pieces = vec![Some(vec![1, 2, 3]), None];
        let err = join(&pieces, &out).unwrap_err();
        assert!(matches!(err, StoreError::MissingPiece(1)));
    }
}
