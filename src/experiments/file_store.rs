//! Durable backend: one JSON file per experiment, one JSON-lines log per
//! experiment's events. Reads are served from an in-memory mirror loaded at
//! startup.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use super::config::Experiment;
use super::event::Event;
use super::store::{
    EventAdmission, ExperimentFilter, ExperimentMutation, ExperimentStorage, MemoryStorage,
};
use crate::error::{ExperimentError, Result};

pub struct FileStorage {
    experiments_dir: PathBuf,
    events_dir: PathBuf,
    memory: MemoryStorage,
}

impl FileStorage {
    pub fn open(data_dir: &Path) -> Result<Self> {
        let experiments_dir = data_dir.join(".experiments");
        let events_dir = data_dir.join(".events");
        std::fs::create_dir_all(&experiments_dir)?;
        std::fs::create_dir_all(&events_dir)?;
        let store = Self {
            experiments_dir,
            events_dir,
            memory: MemoryStorage::new(),
        };
        store.load_experiments()?;
        store.load_events()?;
        tracing::info!(
            dir = %data_dir.display(),
            experiments = store.memory.experiment_count()?,
            "experiment store loaded"
        );
        Ok(store)
    }

    fn load_experiments(&self) -> Result<()> {
        let mut loaded = Vec::new();
        for entry in std::fs::read_dir(&self.experiments_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = std::fs::read_to_string(&path)?;
            let experiment: Experiment = serde_json::from_str(&data)?;
            experiment.validate()?;
            loaded.push(experiment);
        }
        // Directory order is arbitrary; creation time restores insertion order.
        loaded.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        for experiment in loaded {
            self.memory.insert_experiment(experiment)?;
        }
        Ok(())
    }

    fn load_events(&self) -> Result<()> {
        for entry in std::fs::read_dir(&self.events_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let file = std::fs::File::open(&path)?;
            for (lineno, line) in BufReader::new(file).lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Event>(&line) {
                    Ok(event) if self.memory.get_experiment(&event.test_id).is_ok() => self
                        .memory
                        .events
                        .entry(event.test_id.clone())
                        .or_default()
                        .push(event),
                    Ok(event) => tracing::warn!(
                        file = %path.display(),
                        test_id = %event.test_id,
                        "skipping event for unknown experiment"
                    ),
                    Err(e) => tracing::warn!(
                        file = %path.display(),
                        line = lineno + 1,
                        "skipping unreadable event: {}",
                        e
                    ),
                }
            }
        }
        Ok(())
    }

    fn experiment_path(&self, id: &str) -> PathBuf {
        self.experiments_dir.join(format!("{}.json", file_stem(id)))
    }

    fn events_path(&self, test_id: &str) -> PathBuf {
        self.events_dir.join(format!("{}.jsonl", file_stem(test_id)))
    }

    fn atomic_write(&self, experiment: &Experiment) -> Result<()> {
        let final_path = self.experiment_path(&experiment.id);
        let tmp_path = final_path.with_extension("json.tmp");
        let data = serde_json::to_string_pretty(experiment)?;
        std::fs::write(&tmp_path, data)?;
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }
}

/// Ids come from callers; keep them from escaping the data directory.
fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl ExperimentStorage for FileStorage {
    fn insert_experiment(&self, experiment: Experiment) -> Result<Experiment> {
        self.memory.insert_with(experiment, |e| self.atomic_write(e))
    }

    fn get_experiment(&self, id: &str) -> Result<Experiment> {
        self.memory.get_experiment(id)
    }

    fn list_experiments(&self, filter: &ExperimentFilter) -> Result<Vec<Experiment>> {
        self.memory.list_experiments(filter)
    }

    fn update_experiment(&self, id: &str, apply: ExperimentMutation<'_>) -> Result<Experiment> {
        self.memory.update_with(id, apply, |e| self.atomic_write(e))
    }

    fn remove_experiment(&self, id: &str) -> Result<(Experiment, usize)> {
        self.memory.remove_with(id, |id| {
            for path in [self.experiment_path(id), self.events_path(id)] {
                if path.exists() {
                    std::fs::remove_file(&path)?;
                }
            }
            Ok(())
        })
    }

    fn experiment_count(&self) -> Result<usize> {
        self.memory.experiment_count()
    }

    fn append_event(&self, event: Event, admit: EventAdmission<'_>) -> Result<()> {
        self.memory.append_with(event, admit, |event| {
            let mut line = serde_json::to_string(event)?;
            line.push('\n');
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.events_path(&event.test_id))?;
            file.write_all(line.as_bytes())?;
            Ok(())
        })
    }

    fn events_for(&self, test_id: &str) -> Result<Vec<Event>> {
        self.memory.events_for(test_id)
    }
}
