use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Commit;

/// Encode a single commit to [len][bincode][crc32] format.
fn encode_commit(writer: &mut impl Write, commit: &Commit) -> io::Result<()> {
    let payload =
        bincode::serialize(commit).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only Write-Ahead Log of committed transactions.
///
/// Format per entry: `[u32: len][bincode: Commit][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - One entry holds every change of one transaction, so a torn write loses
///   the whole transaction and never part of it.
/// - Truncated last entry (crash) is safely discarded via length-prefix + CRC check.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, commit: &Commit) -> io::Result<()> {
        self.append_buffered(commit)?;
        self.flush_sync()
    }

    /// Append to the BufWriter without flushing or syncing.
    /// Call `flush_sync()` after the batch to durably commit everything buffered.
    pub fn append_buffered(&mut self, commit: &Commit) -> io::Result<()> {
        encode_commit(&mut self.writer, commit)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the snapshot to a temp file and fsync.
    pub fn write_compact_file(path: &Path, snapshot: &Commit) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        encode_commit(&mut writer, snapshot)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, snapshot: &Commit) -> io::Result<()> {
        Self::write_compact_file(&self.path, snapshot)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid commits.
    /// Truncated/corrupt trailing entries are discarded.
    pub fn replay(path: &Path) -> io::Result<Vec<Commit>> {
        Ok(read_entries(path)?.commits)
    }

    /// Replay, then cut any torn or corrupt tail off the file so later
    /// appends land directly after the last valid entry.
    pub fn recover(path: &Path) -> io::Result<Vec<Commit>> {
        let entries = read_entries(path)?;
        if entries.valid_len < entries.file_len {
            tracing::warn!(
                "WAL {}: truncating {} bytes of torn tail",
                path.display(),
                entries.file_len - entries.valid_len
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(entries.valid_len)?;
            file.sync_all()?;
        }
        Ok(entries.commits)
    }
}

struct Entries {
    commits: Vec<Commit>,
    /// Byte length of the prefix made of whole, checksummed entries.
    valid_len: u64,
    file_len: u64,
}

fn read_entries(path: &Path) -> io::Result<Entries> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(Entries {
                commits: Vec::new(),
                valid_len: 0,
                file_len: 0,
            });
        }
        Err(e) => return Err(e),
    };
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut commits = Vec::new();
    let mut valid_len = 0u64;

    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let len = u32::from_le_bytes(len_buf) as u64;
        // A corrupt prefix may claim more than the file holds.
        if valid_len + 4 + len + 4 > file_len {
            tracing::warn!("WAL {}: entry length exceeds file, dropping tail", path.display());
            break;
        }

        let mut payload = vec![0u8; len as usize];
        match reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
            Err(e) => return Err(e),
        }

        let mut crc_buf = [0u8; 4];
        match reader.read_exact(&mut crc_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
            Err(e) => return Err(e),
        }
        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            tracing::warn!("WAL {}: checksum mismatch, dropping tail", path.display());
            break;
        }

        match bincode::deserialize::<Commit>(&payload) {
            Ok(commit) => commits.push(commit),
            Err(_) => break,
        }
        valid_len += 4 + len + 4;
    }

    Ok(Entries {
        commits,
        valid_len,
        file_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("studio_book_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn log_commit(booking_id: Ulid, new_status: BookingStatus) -> Commit {
        Commit {
            id: Ulid::new(),
            committed_at: 1,
            changes: vec![Change::StatusLogged(StatusLogEntry {
                id: Ulid::new(),
                booking_id,
                previous_status: None,
                new_status,
                changed_by: Ulid::new(),
                changed_at: 1,
                reason: "test".into(),
            })],
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let commits = vec![
            log_commit(Ulid::new(), BookingStatus::Pending),
            log_commit(Ulid::new(), BookingStatus::Approved),
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            for c in &commits {
                wal.append(c).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), commits);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        let commit = log_commit(Ulid::new(), BookingStatus::Pending);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&commit).unwrap();
        }
        // Simulate a torn second entry
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![commit]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_cuts_torn_tail_before_appending() {
        let path = tmp_path("recover_tail.wal");
        let first = log_commit(Ulid::new(), BookingStatus::Pending);
        let second = log_commit(Ulid::new(), BookingStatus::Approved);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let valid_len = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7, 0]).unwrap();
        }

        assert_eq!(Wal::recover(&path).unwrap(), vec![first.clone()]);
        assert_eq!(fs::metadata(&path).unwrap().len(), valid_len);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&second).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn oversized_length_prefix_is_a_torn_tail() {
        let path = tmp_path("oversized_len.wal");
        let commit = log_commit(Ulid::new(), BookingStatus::Pending);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&commit).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[1, 2, 3]).unwrap();
        }
        assert_eq!(Wal::recover(&path).unwrap(), vec![commit.clone()]);
        assert_eq!(Wal::replay(&path).unwrap(), vec![commit]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_leaves_clean_file_alone() {
        let path = tmp_path("recover_clean.wal");
        assert!(Wal::recover(&path).unwrap().is_empty());
        assert!(!path.exists());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&log_commit(Ulid::new(), BookingStatus::Pending)).unwrap();
        }
        let len = fs::metadata(&path).unwrap().len();
        assert_eq!(Wal::recover(&path).unwrap().len(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), len);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        {
            let payload = bincode::serialize(&log_commit(Ulid::new(), BookingStatus::Pending)).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let booking_id = Ulid::new();
        let snapshot = log_commit(booking_id, BookingStatus::Pending);
        let later = log_commit(booking_id, BookingStatus::Approved);
        {
            let mut wal = Wal::open(&path).unwrap();
            for _ in 0..10 {
                wal.append(&log_commit(Ulid::new(), BookingStatus::Cancelled)).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            wal.compact(&snapshot).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            assert!(fs::metadata(&path).unwrap().len() < before);
            wal.append(&later).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![snapshot, later]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");
        let commits: Vec<Commit> = (0..5)
            .map(|_| log_commit(Ulid::new(), BookingStatus::Pending))
            .collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for c in &commits {
                wal.append_buffered(c).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), commits);
        let _ = fs::remove_file(&path);
    }
}
