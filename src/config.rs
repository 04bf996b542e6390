// src/config.rs
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::drivers::Endpoint;
use crate::plan::FrequencyPlan;
use crate::recorder::ResultStore;
use crate::state::StatusFiles;

pub const DEFAULT_PROFILE: &str = "Default";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no profile named `{0}`")]
    UnknownProfile(String),
    #[error("cannot remove `{0}`, it is the only profile")]
    LastProfile(String),
    #[error("profile file i/o: {0}")]
    Io(#[from] io::Error),
    #[error("profile file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Where to find the two instruments.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    pub name: String,
    pub oscilloscope: Endpoint,
    pub generator: Endpoint,
}

impl Default for ConnectionProfile {
    fn default() -> Self {
        Self {
            name: DEFAULT_PROFILE.into(),
            oscilloscope: Endpoint::new("172.118.1.3", 3000),
            generator: Endpoint::new("172.118.1.246", 1026),
        }
    }
}

/// Saved profiles plus the one in use. Never empty.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfileBook {
    profiles: Vec<ConnectionProfile>,
    current: String,
}

impl Default for ProfileBook {
    fn default() -> Self {
        Self {
            profiles: vec![ConnectionProfile::default()],
            current: DEFAULT_PROFILE.into(),
        }
    }
}

impl ProfileBook {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let mut book: Self = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        if book.profiles.is_empty() {
            book = Self::default();
        }
        // a hand-edited file may point at a profile that no longer exists
        if book.find(&book.current).is_none() {
            book.current = book.profiles[0].name.clone();
        }
        Ok(book)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut w = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut w, self)?;
        w.flush()?;
        Ok(())
    }

    pub fn profiles(&self) -> &[ConnectionProfile] {
        &self.profiles
    }

    pub fn current_name(&self) -> &str {
        &self.current
    }

    pub fn current(&self) -> &ConnectionProfile {
        self.find(&self.current).unwrap_or(&self.profiles[0])
    }

    pub fn find(&self, name: &str) -> Option<&ConnectionProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    /// Adds a profile or replaces the one with the same name.
    pub fn upsert(&mut self, profile: ConnectionProfile) {
        match self.profiles.iter_mut().find(|p| p.name == profile.name) {
            Some(slot) => *slot = profile,
            None => self.profiles.push(profile),
        }
    }

    pub fn select(&mut self, name: &str) -> Result<(), ConfigError> {
        if self.find(name).is_none() {
            return Err(ConfigError::UnknownProfile(name.into()));
        }
        self.current = name.into();
        Ok(())
    }

    /// Removing the current profile falls back to the first remaining one.
    pub fn remove(&mut self, name: &str) -> Result<ConnectionProfile, ConfigError> {
        let idx = self
            .profiles
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| ConfigError::UnknownProfile(name.into()))?;
        if self.profiles.len() == 1 {
            return Err(ConfigError::LastProfile(name.into()));
        }
        let removed = self.profiles.remove(idx);
        if self.current == removed.name {
            self.current = self.profiles[0].name.clone();
            info!("current profile is now `{}`", self.current);
        }
        Ok(removed)
    }
}

/// Layout of the data directory.
#[derive(Clone, Debug)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn plan_file(&self) -> PathBuf {
        self.root.join("frequencies.json")
    }

    pub fn results_file(&self) -> PathBuf {
        self.root.join("gain_data.json")
    }

    pub fn profiles_file(&self) -> PathBuf {
        self.root.join("profiles.json")
    }

    pub fn status_files(&self) -> StatusFiles {
        StatusFiles::in_dir(&self.root)
    }

    pub fn result_store(&self) -> ResultStore {
        ResultStore::new(self.results_file())
    }

    pub fn load_plan(&self) -> Result<FrequencyPlan, crate::plan::PlanError> {
        FrequencyPlan::load(&self.plan_file())
    }

    pub fn load_profiles(&self) -> Result<ProfileBook, ConfigError> {
        ProfileBook::load(&self.profiles_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("bode-config-{}-{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn lab() -> ConnectionProfile {
        ConnectionProfile {
            name: "Lab B".into(),
            oscilloscope: Endpoint::new("10.0.0.3", 3000),
            generator: Endpoint::new("10.0.0.4", 1026),
        }
    }

    #[test]
    fn missing_file_gives_the_default_profile() {
        let book = ProfileBook::load(&scratch("missing").join("profiles.json")).unwrap();
        assert_eq!(book.current().name, "Default");
        assert_eq!(book.current().generator.to_string(), "172.118.1.246:1026");
        assert_eq!(book.current().oscilloscope.to_string(), "172.118.1.3:3000");
    }

    #[test]
    fn profiles_persist_with_the_current_selection() {
        let path = scratch("persist").join("profiles.json");
        let mut book = ProfileBook::default();
        book.upsert(lab());
        book.select("Lab B").unwrap();
        book.save(&path).unwrap();
        let back = ProfileBook::load(&path).unwrap();
        assert_eq!(back, book);
        assert_eq!(back.current(), &lab());
    }

    #[test]
    fn select_and_remove_check_names() {
        let mut book = ProfileBook::default();
        assert!(matches!(book.select("nope"), Err(ConfigError::UnknownProfile(_))));
        assert!(matches!(book.remove("Default"), Err(ConfigError::LastProfile(_))));
        book.upsert(lab());
        book.select("Lab B").unwrap();
        book.remove("Lab B").unwrap();
        assert_eq!(book.current_name(), "Default");
        assert_eq!(book.profiles().len(), 1);
    }

    #[test]
    fn upsert_replaces_same_name() {
        let mut book = ProfileBook::default();
        book.upsert(lab());
        let mut moved = lab();
        moved.generator = Endpoint::new("10.0.0.40", 1026);
        book.upsert(moved.clone());
        assert_eq!(book.profiles().len(), 2);
        assert_eq!(book.find("Lab B"), Some(&moved));
    }

    #[test]
    fn dangling_current_falls_back_to_first() {
        let path = scratch("dangling").join("profiles.json");
        fs::write(
            &path,
            r#"{"profiles":[{"name":"A","oscilloscope":{"host":"a","port":1},"generator":{"host":"b","port":2}}],"current":"gone"}"#,
        )
        .unwrap();
        assert_eq!(ProfileBook::load(&path).unwrap().current().name, "A");
    }

    #[test]
    fn data_dir_layout() {
        let dir = DataDir::new("data");
        assert_eq!(dir.plan_file(), Path::new("data/frequencies.json"));
        assert_eq!(dir.results_file(), Path::new("data/gain_data.json"));
        assert_eq!(dir.profiles_file(), Path::new("data/profiles.json"));
    }
}
