//! `SpoolFile` — a durable FIFO of opaque compressed batches.
//!
//! Frame format: `[len: u32 BE][len bytes of compressed payload]`. Cursor
//! metadata (`committed_head`, `tail`) lives in a sidecar file, written
//! atomically via temp-file-then-rename so a crash mid-update can never
//! leave a torn cursor pair on disk.

use std::io::{Read as _, Seek, SeekFrom, Write as _};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::errors::SpoolError;

const META_MAGIC: u8 = 1;

/// One append-only data file plus its cursor sidecar, for a single backend.
pub struct SpoolFile {
    data_path: PathBuf,
    meta_path: PathBuf,
    data: std::fs::File,

    /// Next byte a rewrite-loop commit will start from. Durable.
    committed_head: u64,
    /// Advances on `read`, ahead of `committed_head`; reverted by
    /// `rollback_meta`, promoted into `committed_head` by `update_meta`.
    pending_head: u64,
    /// Append position. Durable implicitly via the data file's length.
    tail: u64,
}

impl SpoolFile {
    /// Opens (creating if necessary) the spool for `name` under `dir`.
    pub fn open(dir: &Path, name: &str) -> Result<Self, SpoolError> {
        std::fs::create_dir_all(dir)?;
        let data_path = dir.join(format!("{name}.spool"));
        let meta_path = dir.join(format!("{name}.spool.meta"));

        let data = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&data_path)?;
        let tail = data.metadata()?.len();

        let (committed_head, _version) = Self::read_meta(&meta_path)?.unwrap_or((0, META_MAGIC));
        let committed_head = committed_head.min(tail);

        Ok(SpoolFile {
            data_path,
            meta_path,
            data,
            committed_head,
            pending_head: committed_head,
            tail,
        })
    }

    fn read_meta(meta_path: &Path) -> Result<Option<(u64, u8)>, SpoolError> {
        let bytes = match std::fs::read(meta_path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if bytes.len() < 17 {
            // Torn or truncated sidecar; treat as "nothing committed yet"
            // rather than refusing to start.
            return Ok(None);
        }
        let version = bytes[0];
        let committed_head = u64::from_be_bytes(bytes[1..9].try_into().unwrap());
        Ok(Some((committed_head, version)))
    }

    /// O(1) append; durability is best-effort (OS page cache). Ordering of
    /// appends is always preserved.
    pub fn append(&mut self, payload: &[u8]) -> Result<(), SpoolError> {
        let len = payload.len() as u32;
        self.data.write_all(&len.to_be_bytes())?;
        self.data.write_all(payload)?;
        self.tail += 4 + payload.len() as u64;
        Ok(())
    }

    pub fn has_data(&self) -> bool {
        self.committed_head < self.tail
    }

    /// Returns the next unread batch, advancing `pending_head` past it, or
    /// `None` at logical EOF (`pending_head == tail`). A frame whose length
    /// prefix would run past `tail` is `Corrupt`: the rest of the spool
    /// past `committed_head` is abandoned (pending_head jumps to tail) so a
    /// caller that commits afterwards never retries the same bytes.
    pub fn read(&mut self) -> Result<Option<Bytes>, SpoolError> {
        if self.pending_head >= self.tail {
            return Ok(None);
        }

        let mut reader = self.data.try_clone()?;
        reader.seek(SeekFrom::Start(self.pending_head))?;

        let mut len_buf = [0u8; 4];
        if self.pending_head + 4 > self.tail || reader.read_exact(&mut len_buf).is_err() {
            self.pending_head = self.tail;
            return Err(SpoolError::Corrupt(format!(
                "length prefix at offset {} runs past tail {}",
                self.pending_head, self.tail
            )));
        }
        let len = u32::from_be_bytes(len_buf) as u64;
        if self.pending_head + 4 + len > self.tail {
            self.pending_head = self.tail;
            return Err(SpoolError::Corrupt(format!(
                "frame at offset {} (len {}) runs past tail {}",
                self.pending_head, len, self.tail
            )));
        }

        let mut payload = vec![0u8; len as usize];
        if reader.read_exact(&mut payload).is_err() {
            self.pending_head = self.tail;
            return Err(SpoolError::Corrupt(format!(
                "short read at offset {}",
                self.pending_head
            )));
        }

        self.pending_head += 4 + len;
        Ok(Some(Bytes::from(payload)))
    }

    /// Promotes `committed_head := pending_head`, durably.
    pub fn update_meta(&mut self) -> Result<(), SpoolError> {
        self.committed_head = self.pending_head;
        self.persist_meta()
    }

    /// Reverts `pending_head := committed_head`.
    pub fn rollback_meta(&mut self) {
        self.pending_head = self.committed_head;
    }

    fn persist_meta(&self) -> Result<(), SpoolError> {
        let tmp_path = self.meta_path.with_extension("meta.tmp");
        let mut buf = Vec::with_capacity(17);
        buf.push(META_MAGIC);
        buf.extend_from_slice(&self.committed_head.to_be_bytes());
        buf.extend_from_slice(&self.tail.to_be_bytes());

        let mut tmp = std::fs::File::create(&tmp_path)?;
        tmp.write_all(&buf)?;
        tmp.sync_all()?;
        std::fs::rename(&tmp_path, &self.meta_path)?;
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), SpoolError> {
        self.data.flush()?;
        Ok(())
    }

    #[cfg(test)]
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    #[cfg(test)]
    pub fn committed_head(&self) -> u64 {
        self.committed_head
    }

    #[cfg(test)]
    pub fn pending_head(&self) -> u64 {
        self.pending_head
    }

    #[cfg(test)]
    pub fn tail(&self) -> u64 {
        self.tail
    }
}


#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn arbitrary_batch_sequences_round_trip_in_order(
            batches in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 0..20),
        ) {
            let dir = tempfile::tempdir().unwrap();
            let mut spool = SpoolFile::open(dir.path(), "cpu").unwrap();

            for batch in &batches {
                spool.append(batch).unwrap();
            }

            let mut read_back = Vec::new();
            loop {
                prop_assert!(spool.committed_head() <= spool.pending_head());
                prop_assert!(spool.pending_head() <= spool.tail());
                match spool.read() {
                    Ok(Some(b)) => {
                        read_back.push(b.to_vec());
                        spool.update_meta().unwrap();
                    },
                    Ok(None) => break,
                    Err(_) => break,
                }
            }

            prop_assert_eq!(read_back, batches);
            prop_assert_eq!(spool.committed_head(), spool.tail());
        }
    }
}
