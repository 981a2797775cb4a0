//! Volatile index for tests and throwaway runs.

use super::{IndexError, LocalIndex};
use crate::model::{Backup, Record};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};

#[derive(Default)]
pub struct MemoryIndex {
    backups: DashMap<String, Backup>,
    records: DashMap<(String, PathBuf), Record>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl LocalIndex for MemoryIndex {
    fn register_backup(&self, backup: &Backup) -> Result<(), IndexError> {
        match self.backups.entry(backup.name.clone()) {
            Entry::Occupied(existing) if existing.get().root != backup.root => {
                Err(IndexError::RootMismatch {
                    name: backup.name.clone(),
                    existing: existing.get().root.clone(),
                    requested: backup.root.clone(),
                })
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(backup.clone());
                Ok(())
            }
        }
    }

    fn list_backups(&self) -> Result<Vec<Backup>, IndexError> {
        let mut backups: Vec<Backup> = self.backups.iter().map(|b| b.value().clone()).collect();
        backups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(backups)
    }

    fn get_record(&self, backup: &Backup, path: &Path) -> Result<Option<Record>, IndexError> {
        let key = (backup.name.clone(), path.to_path_buf());
        Ok(self.records.get(&key).map(|r| r.value().clone()))
    }

    fn put_record(&self, record: &Record) -> Result<(), IndexError> {
        self.records
            .insert((record.backup.clone(), record.path.clone()), record.clone());
        Ok(())
    }

    fn list_records(&self, backup: &Backup) -> Result<Vec<Record>, IndexError> {
        let mut records: Vec<Record> = self
            .records
            .iter()
            .filter(|r| r.key().0 == backup.name)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(records)
    }

    fn delete_record(&self, record: &Record) -> Result<(), IndexError> {
        self.records
            .remove(&(record.backup.clone(), record.path.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Fingerprint;

    #[test]
    fn test_put_get_list_delete() {
        let index = MemoryIndex::new();
        let photos = Backup::new("photos", "/data/photos");
        let docs = Backup::new("docs", "/data/docs");

        let a = Record::new(&photos, "/data/photos/a.jpg", Fingerprint::new(1, 1));
        let b = Record::new(&photos, "/data/photos/b.jpg", Fingerprint::new(2, 2));
        let c = Record::new(&docs, "/data/docs/c.txt", Fingerprint::new(3, 3));
        for record in [&b, &a, &c] {
            index.put_record(record).unwrap();
        }

        assert_eq!(index.list_records(&photos).unwrap(), vec![a.clone(), b.clone()]);
        assert_eq!(
            index.get_record(&docs, Path::new("/data/docs/c.txt")).unwrap(),
            Some(c)
        );

        index.delete_record(&a).unwrap();
        assert_eq!(index.get_record(&photos, &a.path).unwrap(), None);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_put_replaces_existing_record() {
        let index = MemoryIndex::new();
        let photos = Backup::new("photos", "/data/photos");
        let mut record = Record::new(&photos, "/data/photos/a.jpg", Fingerprint::new(500, 1));
        index.put_record(&record).unwrap();

        record.refresh(Fingerprint::new(600, 2));
        index.put_record(&record).unwrap();

        assert_eq!(index.len(), 1);
        assert_eq!(
            index.get_record(&photos, &record.path).unwrap().unwrap().size,
            600
        );
    }

    #[test]
    fn test_register_backup_rejects_new_root() {
        let index = MemoryIndex::new();
        index.register_backup(&Backup::new("photos", "/data/photos")).unwrap();
        index.register_backup(&Backup::new("photos", "/data/photos")).unwrap();

        let err = index
            .register_backup(&Backup::new("photos", "/mnt/photos"))
            .unwrap_err();
        assert!(matches!(err, IndexError::RootMismatch { .. }));
        assert_eq!(index.list_backups().unwrap().len(), 1);
    }
}
