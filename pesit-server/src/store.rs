//! Local-directory file store and config-backed partner directory.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use pesit_core::store::{FileStore, PartnerCheck, PartnerDirectory};

use crate::config::PartnerEntry;

/// Stores every virtual file as a plain file under one root directory.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: PathBuf) -> std::io::Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(DirStore { root })
    }

    /// Virtual filenames must stay inside the root.
    fn resolve(&self, name: &str) -> std::io::Result<PathBuf> {
        if name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name.contains("..")
        {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("illegal virtual filename {name:?}"),
            ));
        }
        Ok(self.root.join(name))
    }
}

impl FileStore for DirStore {
    fn exists(&self, name: &str) -> std::io::Result<bool> {
        Ok(self.resolve(name)?.exists())
    }

    fn size(&self, name: &str) -> std::io::Result<u64> {
        Ok(fs::metadata(self.resolve(name)?)?.len())
    }

    fn modified(&self, name: &str) -> std::io::Result<DateTime<Utc>> {
        let modified = fs::metadata(self.resolve(name)?)?.modified()?;
        Ok(modified.into())
    }

    fn open_read(&self, name: &str, offset: u64) -> std::io::Result<Box<dyn Read + Send>> {
        let mut file = File::open(self.resolve(name)?)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Box::new(file))
    }

    fn write(&self, name: &str, data: &[u8]) -> std::io::Result<()> {
        fs::write(self.resolve(name)?, data)
    }

    fn append_at(&self, name: &str, offset: u64, data: &[u8]) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(self.resolve(name)?)?;
        file.set_len(offset)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)
    }
}

/// Partner lookups backed by the config file. An empty partner list runs
/// the server open; otherwise the requester must be listed, enabled, and
/// present the configured password.
pub struct ConfigPartnerDirectory {
    partners: Vec<PartnerEntry>,
}

impl ConfigPartnerDirectory {
    pub fn new(partners: Vec<PartnerEntry>) -> Self {
        ConfigPartnerDirectory { partners }
    }
}

impl PartnerDirectory for ConfigPartnerDirectory {
    fn authenticate(&self, partner: &str, password: Option<&str>) -> PartnerCheck {
        if self.partners.is_empty() {
            return PartnerCheck::Accepted;
        }
        let Some(entry) = self.partners.iter().find(|p| p.id == partner) else {
            return PartnerCheck::Unknown;
        };
        if !entry.enabled {
            return PartnerCheck::Disabled;
        }
        match (&entry.password, password) {
            (None, _) => PartnerCheck::Accepted,
            (Some(expected), Some(given)) if expected == given => PartnerCheck::Accepted,
            _ => PartnerCheck::Denied,
        }
    }

    fn transfer_allowed(&self, _partner: &str, _filename: &str, _write: bool) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir_store() -> (tempfile::TempDir, DirStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path().to_path_buf()).unwrap();
        (dir, store)
    }

    #[test]
    fn write_read_roundtrip() {
        let (_dir, store) = dir_store();
        store.write("FILE", b"payload").unwrap();
        assert!(store.exists("FILE").unwrap());
        assert_eq!(store.size("FILE").unwrap(), 7);
        let mut out = Vec::new();
        store.open_read("FILE", 3).unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"load");
    }

    #[test]
    fn append_at_truncates() {
        let (_dir, store) = dir_store();
        store.write("FILE", b"0123456789").unwrap();
        store.append_at("FILE", 4, b"XY").unwrap();
        let mut out = Vec::new();
        store.open_read("FILE", 0).unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"0123XY");
    }

    #[test]
    fn path_escape_is_rejected() {
        let (_dir, store) = dir_store();
        assert!(store.write("../evil", b"x").is_err());
        assert!(store.write("a/b", b"x").is_err());
        assert!(store.exists("").is_err());
    }

    fn entry(id: &str, password: Option<&str>, enabled: bool) -> PartnerEntry {
        PartnerEntry {
            id: id.into(),
            password: password.map(String::from),
            enabled,
        }
    }

    #[test]
    fn empty_directory_accepts_everyone() {
        let dir = ConfigPartnerDirectory::new(vec![]);
        assert_eq!(dir.authenticate("ANY", None), PartnerCheck::Accepted);
    }

    #[test]
    fn partner_checks() {
        let dir = ConfigPartnerDirectory::new(vec![
            entry("BANK", Some("secret"), true),
            entry("OLD", None, false),
        ]);
        assert_eq!(
            dir.authenticate("BANK", Some("secret")),
            PartnerCheck::Accepted
        );
        assert_eq!(
            dir.authenticate("BANK", Some("wrong")),
            PartnerCheck::Denied
        );
        assert_eq!(dir.authenticate("BANK", None), PartnerCheck::Denied);
        assert_eq!(dir.authenticate("OLD", None), PartnerCheck::Disabled);
        assert_eq!(dir.authenticate("NOBODY", None), PartnerCheck::Unknown);
    }
}
