/*
 * Failmail SMTP buffering relay
 * Copyright (C) 2022 the Failmail developers
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
*/
use anyhow::Context;

/// The host/pid identity stamped into maildir file names. Injected rather
/// than read from globals so tests control it.
#[derive(Debug, Clone)]
pub struct MaildirIdentity {
    /// Host part of generated names.
    pub host: String,
    /// Pid part of generated names.
    pub pid: u32,
}

impl MaildirIdentity {
    /// Identity of the running process.
    #[must_use]
    pub fn local(host: String) -> Self {
        Self {
            host,
            pid: std::process::id(),
        }
    }
}

/// A maildir under one root directory: `cur/`, `new/`, `tmp/`, plus the
/// non-standard `.meta/` used by [`crate::DiskStore`].
///
/// Content files are delivered as `cur/<name>:2,S`; `<name>` follows the
/// `<unix-seconds>.<pid>_<counter>.<host>` pattern with a counter monotonic
/// within this instance.
#[derive(Debug)]
pub struct Maildir {
    root: std::path::PathBuf,
    identity: MaildirIdentity,
    counter: std::sync::atomic::AtomicU64,
}

/// Flag suffix of delivered ("seen") maildir content files.
const CUR_SUFFIX: &str = ":2,S";

impl Maildir {
    /// Open the maildir at `root`, creating it and its subdirectories when
    /// missing.
    ///
    /// # Errors
    ///
    /// * a subdirectory could not be created
    pub fn create(
        root: impl Into<std::path::PathBuf>,
        identity: MaildirIdentity,
    ) -> anyhow::Result<Self> {
        let root = root.into();
        for sub in [".", "cur", "new", "tmp", ".meta"] {
            let dir = root.join(sub);
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("could not create maildir directory `{}`", dir.display()))?;
        }
        Ok(Self {
            root,
            identity,
            counter: std::sync::atomic::AtomicU64::new(0),
        })
    }

    ///
    #[must_use]
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    /// The next unique name for an incoming message.
    fn next_unique_name(&self, now: std::time::SystemTime) -> String {
        let unix = now
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let counter = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;
        format!(
            "{unix}.{pid}_{counter}.{host}",
            pid = self.identity.pid,
            host = self.identity.host
        )
    }

    /// Write a new message: create in `tmp/`, fsync, rename into `cur/`.
    /// Returns the generated name.
    ///
    /// # Errors
    ///
    /// * the file could not be written, synced or renamed
    pub fn write(&self, now: std::time::SystemTime, bytes: &[u8]) -> anyhow::Result<String> {
        let name = self.next_unique_name(now);
        let tmp = self.root.join("tmp").join(&name);
        let cur = self.content_path(&name);

        {
            let mut file = std::fs::File::create(&tmp)
                .with_context(|| format!("could not create `{}`", tmp.display()))?;
            std::io::Write::write_all(&mut file, bytes)
                .with_context(|| format!("could not write `{}`", tmp.display()))?;
            file.sync_all()
                .with_context(|| format!("could not sync `{}`", tmp.display()))?;
        }

        std::fs::rename(&tmp, &cur)
            .with_context(|| format!("could not deliver `{}`", cur.display()))?;
        Ok(name)
    }

    /// Path of a message's content file.
    #[must_use]
    pub fn content_path(&self, name: &str) -> std::path::PathBuf {
        self.root.join("cur").join(format!("{name}{CUR_SUFFIX}"))
    }

    /// Path of a message's metadata file.
    #[must_use]
    pub fn meta_path(&self, name: &str) -> std::path::PathBuf {
        self.root.join(".meta").join(format!("{name}.json"))
    }

    /// The names and modification times of every metadata file.
    ///
    /// # Errors
    ///
    /// * the `.meta` directory could not be read
    pub fn list_meta(&self) -> anyhow::Result<Vec<(String, std::time::SystemTime)>> {
        let dir = self.root.join(".meta");
        let mut entries = Vec::new();
        for entry in dir
            .read_dir()
            .with_context(|| format!("could not list `{}`", dir.display()))?
        {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.strip_suffix(".json"))
                .map(str::to_string)
            else {
                continue;
            };
            entries.push((name, entry.metadata()?.modified()?));
        }
        Ok(entries)
    }

    /// Read a message's content file.
    ///
    /// # Errors
    ///
    /// * the content file is missing or unreadable
    pub fn read_bytes(&self, name: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.content_path(name);
        std::fs::read(&path).with_context(|| format!("could not read `{}`", path.display()))
    }

    /// Remove a message's content file. Removing an absent file succeeds.
    ///
    /// # Errors
    ///
    /// * the removal failed for a reason other than the file being gone
    pub fn remove(&self, name: &str) -> anyhow::Result<()> {
        remove_if_present(&self.content_path(name))
    }
}

pub(crate) fn remove_if_present(path: &std::path::Path) -> anyhow::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("could not remove `{}`", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> MaildirIdentity {
        MaildirIdentity {
            host: "testhost".to_string(),
            pid: 42,
        }
    }

    #[test]
    fn creates_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        Maildir::create(dir.path().join("md"), identity()).unwrap();

        for sub in ["cur", "new", "tmp", ".meta"] {
            assert!(dir.path().join("md").join(sub).is_dir(), "{sub} missing");
        }
    }

    #[test]
    fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let maildir = Maildir::create(dir.path(), identity()).unwrap();

        let now = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_393_650_000);
        let name = maildir.write(now, b"Subject: test\r\n\r\nbody\r\n").unwrap();

        assert_eq!(name, "1393650000.42_1.testhost");
        assert!(maildir.content_path(&name).ends_with("cur/1393650000.42_1.testhost:2,S"));
        assert_eq!(
            maildir.read_bytes(&name).unwrap(),
            b"Subject: test\r\n\r\nbody\r\n"
        );
        // nothing left behind in tmp
        assert_eq!(std::fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }

    #[test]
    fn names_are_unique_within_an_instance() {
        let dir = tempfile::tempdir().unwrap();
        let maildir = Maildir::create(dir.path(), identity()).unwrap();

        let now = std::time::SystemTime::now();
        let first = maildir.write(now, b"a").unwrap();
        let second = maildir.write(now, b"b").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let maildir = Maildir::create(dir.path(), identity()).unwrap();

        let name = maildir.write(std::time::SystemTime::now(), b"x").unwrap();
        maildir.remove(&name).unwrap();
        maildir.remove(&name).unwrap();
        assert!(maildir.read_bytes(&name).is_err());
    }
}
