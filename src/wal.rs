use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Record;

/// Largest entry written or replayed. A corrupt length prefix must not turn
/// into a huge allocation on replay.
pub(crate) const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

fn encode_record(writer: &mut impl Write, record: &Record) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_RECORD_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "record too large"));
    }
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Read exactly `buf.len()` bytes. `Ok(false)` means the file ended first.
fn read_frame(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only log of scheduling records.
///
/// Format per entry: `[u32: len][bincode: Record][u32: crc32]`, little endian.
/// One entry is one atomic change, however many groups and instances it
/// covers. A torn or corrupt tail (crash mid-write) ends replay at the last
/// good entry.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length after the last successful `flush_sync`.
    durable_len: u64,
    /// Records buffered since then.
    unsynced: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            durable_len,
            unsynced: 0,
        })
    }

    /// Append and fsync one record. Tests only; the engine batches through
    /// `append_buffered` + `flush_sync`.
    #[cfg(test)]
    pub fn append(&mut self, record: &Record) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Buffer a record without syncing. Durable only after `flush_sync`.
    pub fn append_buffered(&mut self, record: &Record) -> io::Result<()> {
        encode_record(&mut self.writer, record)?;
        self.appends_since_compact += 1;
        self.unsynced += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        let file = self.writer.get_ref();
        file.sync_all()?;
        self.durable_len = file.metadata()?.len();
        self.unsynced = 0;
        Ok(())
    }

    /// Forget everything appended since the last successful `flush_sync`:
    /// buffered bytes are dropped unwritten and anything that already reached
    /// the file is truncated away, so replay never sees a failed batch.
    pub fn rollback(&mut self) -> io::Result<()> {
        let placeholder = BufWriter::new(self.writer.get_ref().try_clone()?);
        let (file, _discarded) = std::mem::replace(&mut self.writer, placeholder).into_parts();
        file.set_len(self.durable_len)?;
        file.sync_all()?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact -= self.unsynced;
        self.unsynced = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot to `<path>.wal.tmp` and fsync it.
    pub fn write_compact_file(path: &Path, records: &[Record]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        for record in records {
            encode_record(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the log and reopen for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.unsynced = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, records: &[Record]) -> io::Result<()> {
        Self::write_compact_file(&self.path, records)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact record in the log, oldest first. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Record>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            if !read_frame(&mut reader, &mut len_buf)? {
                break;
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_RECORD_LEN {
                break;
            }

            let mut payload = vec![0u8; len];
            let mut crc_buf = [0u8; 4];
            if !read_frame(&mut reader, &mut payload)? || !read_frame(&mut reader, &mut crc_buf)? {
                break; // torn tail
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }

            match bincode::deserialize::<Record>(&payload) {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("cohort_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn group(owner: ActorId) -> Group {
        Group {
            id: Ulid::new(),
            name: "geology".into(),
            owner,
            archived: false,
            color: "#334455".into(),
            grants: CapabilityGrants::default(),
            members: Vec::new(),
        }
    }

    fn scheduled(owner: ActorId, group_id: Ulid, n: usize) -> Record {
        let series = Ulid::new();
        let events = (0..n)
            .map(|k| ScheduledEvent {
                id: Ulid::new(),
                group_id,
                title: "field trip".into(),
                span: Span::new(k as Ms * 1000, k as Ms * 1000 + 500),
                creator: owner,
                series_id: Some(series),
                repeat_count: n as u32 - 1,
            })
            .collect();
        Record::EventsScheduled {
            owners: vec![owner],
            events,
        }
    }

    #[test]
    fn multi_instance_record_replays_whole() {
        let path = tmp_path("multi_instance.wal");
        let owner = Ulid::new();
        let g = group(owner);
        let records = vec![
            Record::ActorRegistered { id: owner, display_name: "Mo".into() },
            Record::GroupCreated { group: g.clone() },
            scheduled(owner, g.id, 5),
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for r in &records {
                wal.append(r).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), records);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn torn_tail_is_dropped() {
        let path = tmp_path("torn_tail.wal");
        let owner = Ulid::new();
        let first = Record::GroupCreated { group: group(owner) };

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        // Half of a second entry: a length prefix claiming more than follows.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&200u32.to_le_bytes()).unwrap();
            f.write_all(&[7u8; 13]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_discards_unsynced_records() {
        let path = tmp_path("rollback.wal");
        let owner = Ulid::new();
        let kept = Record::GroupCreated { group: group(owner) };
        let failed_a = scheduled(owner, Ulid::new(), 3);
        let failed_b = Record::GroupArchived { group_id: Ulid::new(), owner };
        let later = Record::MemberJoined { group_id: Ulid::new(), owner, actor: Ulid::new() };

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&kept).unwrap();
        let durable = fs::metadata(&path).unwrap().len();

        // One record pushed to the file without a sync, one still buffered.
        wal.append_buffered(&failed_a).unwrap();
        wal.writer.flush().unwrap();
        wal.append_buffered(&failed_b).unwrap();
        assert!(fs::metadata(&path).unwrap().len() > durable);

        wal.rollback().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), durable);
        assert_eq!(wal.appends_since_compact(), 1);

        wal.append(&later).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, later]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn oversized_record_is_refused() {
        let path = tmp_path("oversized.wal");
        let huge = Record::ActorRegistered {
            id: Ulid::new(),
            display_name: "x".repeat(MAX_RECORD_LEN),
        };
        let mut wal = Wal::open(&path).unwrap();
        let err = wal.append_buffered(&huge).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(wal.appends_since_compact(), 0);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_empty_log() {
        let path = tmp_path("never_written.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn bad_checksum_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        let good = Record::GroupArchived { group_id: Ulid::new(), owner: Ulid::new() };
        let bad = Record::MemberLeft { group_id: Ulid::new(), owner: Ulid::new(), actor: Ulid::new() };

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&bad).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&(crc32fast::hash(&payload) ^ 1).to_le_bytes()).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn absurd_length_prefix_stops_replay() {
        let path = tmp_path("absurd_len.wal");
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[0u8; 16]).unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn snapshot_replaces_history_and_accepts_appends() {
        let path = tmp_path("snapshot.wal");
        let owner = Ulid::new();
        let g = group(owner);

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&Record::GroupCreated { group: g.clone() }).unwrap();
        for _ in 0..20 {
            let Record::EventsScheduled { events, .. } = scheduled(owner, g.id, 3) else {
                unreachable!()
            };
            let ids = events.iter().map(|e| e.id).collect();
            wal.append(&Record::EventsScheduled { owners: vec![owner], events }).unwrap();
            wal.append(&Record::EventsDeleted { owners: vec![owner], ids }).unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 41);
        let before = fs::metadata(&path).unwrap().len();

        let snapshot = vec![Record::GroupCreated { group: g.clone() }];
        wal.compact(&snapshot).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        assert!(fs::metadata(&path).unwrap().len() < before);

        let after = Record::GrantsUpdated { group_id: g.id, owner, grants: CapabilityGrants::all() };
        wal.append(&after).unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![snapshot[0].clone(), after]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_land_after_sync() {
        let path = tmp_path("buffered.wal");
        let owner = Ulid::new();
        let records: Vec<Record> = (0..4)
            .map(|_| Record::MemberJoined { group_id: Ulid::new(), owner, actor: Ulid::new() })
            .collect();

        let mut wal = Wal::open(&path).unwrap();
        for r in &records {
            wal.append_buffered(r).unwrap();
        }
        wal.flush_sync().unwrap();

        assert_eq!(Wal::replay(&path).unwrap(), records);
        let _ = fs::remove_file(&path);
    }
}
