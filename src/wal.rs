use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Change;

/// Entries larger than this are treated as corruption.
const MAX_ENTRY_LEN: usize = 64 * 1024 * 1024;

/// Encode a single change to [len][bincode][crc32] format.
fn encode_change(writer: &mut impl Write, change: &Change) -> io::Result<()> {
    let payload =
        bincode::serialize(change).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only Write-Ahead Log.
///
/// Format per entry: `[u32: len][bincode: Change][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - Truncated last entry (crash) is safely discarded via length-prefix + CRC check.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length as of the last successful `flush_sync`.
    durable_len: u64,
    /// Appends buffered since then.
    unsynced: u64,
    /// Set while a rollback is outstanding; the next append retries it.
    rolling_back: bool,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            durable_len,
            unsynced: 0,
            rolling_back: false,
        })
    }

    /// Append a single change and fsync. Production code goes through
    /// `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, change: &Change) -> io::Result<()> {
        self.append_buffered(change)?;
        self.flush_sync()
    }

    /// Append a single change to the BufWriter without flushing or syncing.
    /// Call `flush_sync()` after the batch to durably commit everything buffered.
    pub fn append_buffered(&mut self, change: &Change) -> io::Result<()> {
        if self.rolling_back {
            self.rollback()?;
        }
        encode_change(&mut self.writer, change)?;
        self.appends_since_compact += 1;
        self.unsynced += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.rolling_back {
            return self.rollback();
        }
        self.writer.flush()?;
        let file = self.writer.get_ref();
        file.sync_all()?;
        self.durable_len = file.metadata()?.len();
        self.unsynced = 0;
        Ok(())
    }

    /// Discard everything appended since the last successful `flush_sync`:
    /// drop the buffered bytes and truncate whatever already reached the file.
    /// A failed batch must never become durable through a later flush.
    pub fn rollback(&mut self) -> io::Result<()> {
        self.rolling_back = true;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the buffer without writing it out
        drop(stale.into_parts());
        let file = self.writer.get_ref();
        file.set_len(self.durable_len)?;
        file.sync_all()?;
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.unsynced);
        self.unsynced = 0;
        self.rolling_back = false;
        Ok(())
    }

    /// Return the WAL file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write compacted changes to a temp file and fsync.
    pub fn write_compact_file(path: &Path, changes: &[Change]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for change in changes {
            encode_change(&mut writer, change)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename the temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.unsynced = 0;
        self.rolling_back = false;
        Ok(())
    }

    /// Both compaction phases in one call.
    #[cfg(test)]
    pub fn compact(&mut self, changes: &[Change]) -> io::Result<()> {
        Self::write_compact_file(&self.path, changes)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid changes.
    /// Truncated/corrupt trailing entries are discarded with a warning.
    pub fn replay(path: &Path) -> io::Result<Vec<Change>> {
        Ok(Self::scan(path)?.0)
    }

    /// Replay, then cut any invalid tail off the file so later appends
    /// aren't stranded behind it.
    pub fn recover(path: &Path) -> io::Result<Vec<Change>> {
        let (changes, valid_len) = Self::scan(path)?;
        if let Ok(meta) = fs::metadata(path)
            && meta.len() > valid_len
        {
            tracing::warn!(
                discarded_bytes = meta.len() - valid_len,
                "truncating invalid WAL tail"
            );
            OpenOptions::new().write(true).open(path)?.set_len(valid_len)?;
        }
        Ok(changes)
    }

    /// Decode entries until EOF or the first invalid one. Returns the changes
    /// and the byte length of the valid prefix.
    fn scan(path: &Path) -> io::Result<(Vec<Change>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut changes = Vec::new();
        let mut valid_len: u64 = 0;

        loop {
            // Read length prefix
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_ENTRY_LEN {
                tracing::warn!(entry = changes.len(), len, "implausible WAL entry length, stopping replay");
                break;
            }

            // Read payload
            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    tracing::warn!(entry = changes.len(), "discarding truncated WAL entry");
                    break;
                }
                Err(e) => return Err(e),
            }

            // Read CRC
            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            let stored_crc = u32::from_le_bytes(crc_buf);
            let computed_crc = crc32fast::hash(&payload);

            if stored_crc != computed_crc {
                tracing::warn!(entry = changes.len(), "WAL checksum mismatch, stopping replay");
                break;
            }

            match bincode::deserialize::<Change>(&payload) {
                Ok(change) => changes.push(change),
                Err(e) => {
                    tracing::warn!(entry = changes.len(), "undecodable WAL entry, stopping replay: {e}");
                    break;
                }
            }
            valid_len += (len + 8) as u64;
        }

        Ok((changes, valid_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ulid::Ulid;

    use crate::model::{Booking, Event, TimeSlot, SLOT_STATUS_AVAILABLE};

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn event_created() -> Change {
        let now = Utc::now();
        let event = Event {
            id: Ulid::new(),
            title: "Office hours".into(),
            description: "Bring questions".into(),
            creator_name: "Grace".into(),
            creator_email: "grace@example.com".into(),
            created_at: now,
            updated_at: now,
        };
        let slot = TimeSlot {
            id: Ulid::new(),
            event_id: event.id,
            start_time: now,
            end_time: now + chrono::Duration::minutes(30),
            max_bookings: 2,
            status: SLOT_STATUS_AVAILABLE.into(),
            created_at: now,
            current_bookings: 0,
        };
        Change::EventCreated {
            event,
            slots: vec![slot],
        }
    }

    fn booking_on(change: &Change) -> Change {
        let Change::EventCreated { event, slots } = change else {
            panic!("expected EventCreated");
        };
        Change::BookingCreated {
            booking: Booking {
                id: Ulid::new(),
                event_id: event.id,
                time_slot_id: slots[0].id,
                attendee_name: "Ada".into(),
                attendee_email: "ada@example.com".into(),
                created_at: Utc::now(),
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let _ = fs::remove_file(&path);

        let created = event_created();
        let changes = vec![created.clone(), booking_on(&created)];

        {
            let mut wal = Wal::open(&path).unwrap();
            for c in &changes {
                wal.append(c).unwrap();
            }
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, changes);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        let _ = fs::remove_file(&path);

        let change = event_created();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&change).unwrap();
        }

        // Append garbage to simulate a torn second entry
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![change]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_truncates_tail_so_new_appends_survive() {
        let path = tmp_path("recover_tail.wal");
        let _ = fs::remove_file(&path);

        let first = event_created();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0xFFu8; 3]).unwrap();
        }

        let recovered = Wal::recover(&path).unwrap();
        assert_eq!(recovered, vec![first.clone()]);

        let second = booking_on(&first);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&second).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![first, second]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let _ = fs::remove_file(&path);
        assert!(Wal::replay(&path).unwrap().is_empty());
        assert!(Wal::recover(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let _ = fs::remove_file(&path);

        let change = Change::EventDeleted { id: Ulid::new() };
        {
            let payload = bincode::serialize(&change).unwrap();
            let len = payload.len() as u32;
            let bad_crc: u32 = 0xDEADBEEF;

            let mut f = File::create(&path).unwrap();
            f.write_all(&len.to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&bad_crc.to_le_bytes()).unwrap();
        }

        assert!(Wal::replay(&path).unwrap().is_empty());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let _ = fs::remove_file(&path);

        let created = event_created();
        let Change::EventCreated { slots, .. } = &created else {
            unreachable!()
        };
        let churn = Change::SlotCounterSet {
            id: slots[0].id,
            current_bookings: 5,
        };
        let compacted = vec![created.clone()];
        let after = booking_on(&created);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&created).unwrap();
            for _ in 0..10 {
                wal.append(&churn).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();

            wal.compact(&compacted).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            let shrunk = fs::metadata(&path).unwrap().len();
            assert!(shrunk < before, "compacted WAL should be smaller: {shrunk} < {before}");

            wal.append(&after).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![created, after]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");
        let _ = fs::remove_file(&path);

        let changes: Vec<Change> = (0..5).map(|_| event_created()).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for c in &changes {
                wal.append_buffered(c).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), changes);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_discards_failed_batch_before_next_flush() {
        let path = tmp_path("rollback.wal");
        let _ = fs::remove_file(&path);

        let durable = event_created();
        let failed: Vec<Change> = (0..3).map(|_| event_created()).collect();
        let after = event_created();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&durable).unwrap();
            let synced_len = fs::metadata(&path).unwrap().len();

            for c in &failed {
                wal.append_buffered(c).unwrap();
            }
            // A flush that dies midway leaves part of the batch in the file
            {
                let mut f = OpenOptions::new().append(true).open(&path).unwrap();
                f.write_all(&[7u8; 11]).unwrap();
            }
            wal.rollback().unwrap();
            assert_eq!(fs::metadata(&path).unwrap().len(), synced_len);
            assert_eq!(wal.appends_since_compact(), 1);

            wal.append_buffered(&after).unwrap();
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![durable, after]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_truncates_bytes_the_buffer_already_spilled() {
        let path = tmp_path("rollback_spill.wal");
        let _ = fs::remove_file(&path);

        let durable = event_created();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&durable).unwrap();
            let synced_len = fs::metadata(&path).unwrap().len();

            // Enough entries to overflow the BufWriter so some bytes hit the file
            for _ in 0..500 {
                wal.append_buffered(&event_created()).unwrap();
            }
            assert!(fs::metadata(&path).unwrap().len() > synced_len);

            wal.rollback().unwrap();
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![durable]);

        let _ = fs::remove_file(&path);
    }
}
