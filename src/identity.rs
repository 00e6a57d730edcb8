use std::{fs::Metadata, os::unix::fs::MetadataExt};

use tracing::{debug, warn};

use crate::{data_file::DataFile, error::StateError, state_store::StateStore};

/// Storage identity of a file, stable across renames
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity {
    pub device: u64,
    pub inode: u64,
}

impl From<&Metadata> for Identity {
    fn from(metadata: &Metadata) -> Self {
        Identity {
            device: metadata.dev(),
            inode: metadata.ino(),
        }
    }
}

/// Bind every tracked file to its stored record, if one exists.
///
/// The first record with a matching `device:inode` prefix wins. An offset beyond the current
/// size of the file means the file was truncated since the last run, so display restarts at
/// zero.
pub fn lookup(store: &StateStore, files: &mut [DataFile]) -> Result<(), StateError> {
    let records = store.records();
    if records.is_empty() {
        return Ok(());
    }
    let format = store.format();

    for file in files.iter_mut() {
        let key = format.encode_key(file.identity)?;
        let Some((at, record)) = format
            .records(records)
            .find(|(_, record)| record.starts_with(&key))
        else {
            continue;
        };

        let Some(mut had) = format.decode_offset(record) else {
            return Err(StateError::Corrupt {
                path: store.path().to_path_buf(),
                offset: at + format.prefix_len() + 1,
            });
        };

        file.record = Some(at);
        if had > file.now {
            warn!(
                file = %file.name.display(),
                recorded = had,
                size = file.now,
                "considering file to be truncated, displaying from start"
            );
            had = 0;
            file.status.dirty = true;
        }
        file.had = had;
        if file.pos != had {
            file.pos = had;
            file.status.jump = true;
        }

        debug!(
            file = %file.name.display(),
            record = at,
            now = file.now,
            had,
            "found record"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{fs, io::Write};

    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;
    use crate::{
        record::{FieldWidths, RecordFormat},
        state_store::{Candidate, StoreSettings},
    };

    struct Fixture {
        dir: TempDir,
        settings: StoreSettings,
    }

    impl Fixture {
        fn target(&self, name: &str, content: &[u8]) -> DataFile {
            let path = self.dir.path().join(name);
            fs::File::create(&path).unwrap().write_all(content).unwrap();
            DataFile::open(&path).unwrap()
        }

        fn store_with(&self, records: &[(Identity, u64)]) -> StateStore {
            let path = self.dir.path().join("state");
            let format = RecordFormat::new(self.settings.arch).unwrap();
            let mut content = vec![];
            for &(identity, offset) in records {
                format.encode_into(identity, offset, &mut content).unwrap();
            }
            fs::write(&path, content).unwrap();
            StateStore::open(&[Candidate::new(path)], self.settings).unwrap()
        }
    }

    #[fixture]
    fn fixture() -> Fixture {
        Fixture {
            dir: tempfile::tempdir().unwrap(),
            settings: StoreSettings {
                arch: FieldWidths::native(),
                ..StoreSettings::default()
            },
        }
    }

    #[rstest]
    fn record_is_bound_by_identity(fixture: Fixture) {
        let mut files = vec![fixture.target("a", b"0123456789")];
        let other = Identity {
            device: 1,
            inode: 1,
        };
        let store = fixture.store_with(&[(other, 3), (files[0].identity, 4)]);

        lookup(&store, &mut files).unwrap();

        let record_len = store.format().record_len();
        assert_eq!(files[0].record, Some(record_len));
        assert_eq!(files[0].pos, 4);
        assert!(files[0].status.jump);
        assert!(!files[0].status.dirty);
    }

    #[rstest]
    fn offset_beyond_size_is_truncation(fixture: Fixture) {
        let mut files = vec![fixture.target("a", &[b'x'; 30])];
        let store = fixture.store_with(&[(files[0].identity, 50)]);

        lookup(&store, &mut files).unwrap();

        assert_eq!(files[0].record, Some(0));
        assert_eq!(files[0].pos, 0);
        assert!(files[0].status.dirty);
    }

    #[rstest]
    fn unknown_file_stays_unbound(fixture: Fixture) {
        let mut files = vec![fixture.target("a", b"abc")];
        let store = fixture.store_with(&[(
            Identity {
                device: 7,
                inode: 7,
            },
            1,
        )]);

        lookup(&store, &mut files).unwrap();

        assert_eq!(files[0].record, None);
        assert_eq!(files[0].pos, 0);
    }

    #[rstest]
    fn first_matching_record_wins(fixture: Fixture) {
        let mut files = vec![fixture.target("a", b"0123456789")];
        let identity = files[0].identity;
        let store = fixture.store_with(&[(identity, 2), (identity, 8)]);

        lookup(&store, &mut files).unwrap();

        assert_eq!(files[0].record, Some(0));
        assert_eq!(files[0].pos, 2);
    }
}
