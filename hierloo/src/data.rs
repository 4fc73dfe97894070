//! Datasets consumed by the models
//!
//! Two shapes are supported: grouped binary trials (shots on goal, one record
//! per shot) and a binomial count series (one record per polling step).
//! Both can be read from and written to CSV and exported as Stan JSON data.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;

/// One shot faced by a keeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shot {
    /// Index into [`SaveDataset::groups`]
    pub group: usize,
    pub saved: bool,
}

/// Grouped binary outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveDataset {
    pub groups: Vec<String>,
    pub shots: Vec<Shot>,
}

/// Binomial successes observed at increasing times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollDataset {
    pub times: Vec<f64>,
    pub successes: Vec<u32>,
    pub trials: Vec<u32>,
}

/// Either dataset shape, as accepted by [`crate::model::ModelSpec::bind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataSet {
    Saves(SaveDataset),
    Polls(PollDataset),
}

impl SaveDataset {
    pub fn new(groups: Vec<String>, shots: Vec<Shot>) -> Result<Self> {
        let data = Self { groups, shots };
        data.validate()?;
        Ok(data)
    }

    pub fn n_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn len(&self) -> usize {
        self.shots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shots.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.groups.is_empty() {
            return Err(Error::DataContract("dataset has no groups".to_string()));
        }
        if let Some(shot) = self.shots.iter().find(|s| s.group >= self.groups.len()) {
            return Err(Error::DataContract(format!(
                "group index {} out of range for {} groups",
                shot.group,
                self.groups.len()
            )));
        }
        Ok(())
    }

    /// (successes, failures) per group.
    pub fn counts(&self) -> Vec<(u32, u32)> {
        let mut counts = vec![(0u32, 0u32); self.groups.len()];
        for shot in &self.shots {
            if shot.saved {
                counts[shot.group].0 += 1;
            } else {
                counts[shot.group].1 += 1;
            }
        }
        counts
    }

    /// The same shots renumbered to follow `groups`, which must name exactly
    /// this dataset's keepers in some order.
    pub fn aligned_to(&self, groups: &[String]) -> Result<SaveDataset> {
        if groups.len() != self.groups.len() {
            return Err(Error::DataContract(format!(
                "expected {} groups, found {}",
                groups.len(),
                self.groups.len()
            )));
        }
        let index = self
            .groups
            .iter()
            .map(|name| {
                groups.iter().position(|g| g == name).ok_or_else(|| {
                    Error::DataContract(format!("unknown group '{}'", name))
                })
            })
            .collect::<Result<Vec<usize>>>()?;
        let mut seen = vec![false; groups.len()];
        for &j in &index {
            if seen[j] {
                return Err(Error::DataContract(format!(
                    "group '{}' appears twice",
                    groups[j]
                )));
            }
            seen[j] = true;
        }
        let shots = self
            .shots
            .iter()
            .map(|shot| Shot {
                group: index[shot.group],
                saved: shot.saved,
            })
            .collect();
        SaveDataset::new(groups.to_vec(), shots)
    }

    /// SHA-256 over group names and the ordered shot records.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"saves\n");
        for name in &self.groups {
            hasher.update(name.as_bytes());
            hasher.update(b"\n");
        }
        for shot in &self.shots {
            hasher.update(format!("{},{}\n", shot.group, u8::from(shot.saved)).as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    /// Load `keeper,saved` records. Groups are numbered in order of first
    /// appearance.
    pub fn from_csv(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse_csv(&content)
    }

    pub fn parse_csv(content: &str) -> Result<Self> {
        let mut lines = content.lines();
        let header = lines.next().ok_or(Error::Parse {
            line: 1,
            message: "empty CSV".to_string(),
        })?;
        let columns: Vec<&str> = header.split(',').map(|s| s.trim()).collect();
        let keeper_idx = column_index(&columns, "keeper")?;
        let saved_idx = column_index(&columns, "saved")?;

        let mut groups: Vec<String> = Vec::new();
        let mut shots = Vec::new();
        for (line_num, line) in lines.enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let values: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
            if values.len() != columns.len() {
                return Err(Error::Parse {
                    line: line_num + 2,
                    message: format!("{} columns, expected {}", values.len(), columns.len()),
                });
            }
            let keeper = values[keeper_idx];
            let group = match groups.iter().position(|g| g == keeper) {
                Some(idx) => idx,
                None => {
                    groups.push(keeper.to_string());
                    groups.len() - 1
                }
            };
            let saved = match values[saved_idx] {
                "1" | "true" | "TRUE" => true,
                "0" | "false" | "FALSE" => false,
                other => {
                    return Err(Error::Parse {
                        line: line_num + 2,
                        message: format!("invalid saved value '{}'", other),
                    })
                }
            };
            shots.push(Shot { group, saved });
        }
        Self::new(groups, shots)
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut file = fs::File::create(path)?;
        writeln!(file, "keeper,saved")?;
        for shot in &self.shots {
            writeln!(file, "{},{}", self.groups[shot.group], u8::from(shot.saved))?;
        }
        Ok(())
    }
}

impl PollDataset {
    pub fn new(times: Vec<f64>, successes: Vec<u32>, trials: Vec<u32>) -> Result<Self> {
        let data = Self {
            times,
            successes,
            trials,
        };
        data.validate()?;
        Ok(data)
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.times.is_empty() {
            return Err(Error::DataContract("series has no time steps".to_string()));
        }
        if self.successes.len() != self.times.len() || self.trials.len() != self.times.len() {
            return Err(Error::DataContract(format!(
                "length mismatch: {} times, {} successes, {} trials",
                self.times.len(),
                self.successes.len(),
                self.trials.len()
            )));
        }
        if self.times.windows(2).any(|w| w[1] <= w[0]) {
            return Err(Error::DataContract(
                "times must be strictly increasing".to_string(),
            ));
        }
        if let Some(t) = (0..self.len()).find(|&t| self.successes[t] > self.trials[t]) {
            return Err(Error::DataContract(format!(
                "step {}: {} successes out of {} trials",
                t, self.successes[t], self.trials[t]
            )));
        }
        Ok(())
    }

    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"polls\n");
        for t in 0..self.len() {
            hasher.update(
                format!(
                    "{},{},{}\n",
                    self.times[t].to_bits(),
                    self.successes[t],
                    self.trials[t]
                )
                .as_bytes(),
            );
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn from_csv(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse_csv(&content)
    }

    /// Parse `time,successes,trials` records.
    pub fn parse_csv(content: &str) -> Result<Self> {
        let mut lines = content.lines();
        let header = lines.next().ok_or(Error::Parse {
            line: 1,
            message: "empty CSV".to_string(),
        })?;
        let columns: Vec<&str> = header.split(',').map(|s| s.trim()).collect();
        let time_idx = column_index(&columns, "time")?;
        let succ_idx = column_index(&columns, "successes")?;
        let trials_idx = column_index(&columns, "trials")?;

        let mut times: Vec<f64> = Vec::new();
        let mut successes: Vec<u32> = Vec::new();
        let mut trials: Vec<u32> = Vec::new();
        for (line_num, line) in lines.enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let values: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
            if values.len() != columns.len() {
                return Err(Error::Parse {
                    line: line_num + 2,
                    message: format!("{} columns, expected {}", values.len(), columns.len()),
                });
            }
            let parse_err = |what: &str| Error::Parse {
                line: line_num + 2,
                message: format!("invalid {}", what),
            };
            times.push(values[time_idx].parse().map_err(|_| parse_err("time"))?);
            successes.push(values[succ_idx].parse().map_err(|_| parse_err("successes"))?);
            trials.push(values[trials_idx].parse().map_err(|_| parse_err("trials"))?);
        }
        Self::new(times, successes, trials)
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut file = fs::File::create(path)?;
        writeln!(file, "time,successes,trials")?;
        for t in 0..self.len() {
            writeln!(
                file,
                "{},{},{}",
                self.times[t], self.successes[t], self.trials[t]
            )?;
        }
        Ok(())
    }
}

impl DataSet {
    pub fn n_obs(&self) -> usize {
        match self {
            DataSet::Saves(d) => d.len(),
            DataSet::Polls(d) => d.len(),
        }
    }

    pub fn fingerprint(&self) -> String {
        match self {
            DataSet::Saves(d) => d.fingerprint(),
            DataSet::Polls(d) => d.fingerprint(),
        }
    }
}

impl From<SaveDataset> for DataSet {
    fn from(data: SaveDataset) -> Self {
        DataSet::Saves(data)
    }
}

impl From<PollDataset> for DataSet {
    fn from(data: PollDataset) -> Self {
        DataSet::Polls(data)
    }
}

fn column_index(columns: &[&str], name: &str) -> Result<usize> {
    columns
        .iter()
        .position(|&c| c == name)
        .ok_or_else(|| Error::Parse {
            line: 1,
            message: format!("missing {} column", name),
        })
}

/// Stan data block values for a save-rate model. Group indices are 1-based.
pub fn save_stan_json(data: &SaveDataset, fixed_tau: Option<f64>) -> serde_json::Value {
    let group: Vec<usize> = data.shots.iter().map(|s| s.group + 1).collect();
    let y: Vec<u8> = data.shots.iter().map(|s| u8::from(s.saved)).collect();
    let mut value = json!({
        "N": data.len(),
        "J": data.n_groups(),
        "group": group,
        "y": y,
    });
    if let Some(tau) = fixed_tau {
        value["tau"] = json!(tau);
    }
    value
}

/// Stan data block values for the polling walk model.
pub fn poll_stan_json(data: &PollDataset, length_scale: f64) -> serde_json::Value {
    json!({
        "T": data.len(),
        "time": data.times,
        "y": data.successes,
        "n": data.trials,
        "length_scale": length_scale,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> SaveDataset {
        SaveDataset::new(
            vec!["a".to_string(), "b".to_string()],
            vec![
                Shot { group: 0, saved: true },
                Shot { group: 1, saved: false },
                Shot { group: 0, saved: false },
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_counts() {
        assert_eq!(tiny().counts(), vec![(1, 1), (0, 1)]);
    }

    #[test]
    fn test_fingerprint_depends_on_order() {
        let data = tiny();
        let mut swapped = data.clone();
        swapped.shots.swap(0, 2);
        assert_eq!(data.fingerprint(), tiny().fingerprint());
        assert_ne!(data.fingerprint(), swapped.fingerprint());
    }

    #[test]
    fn test_aligned_to_renumbers_by_name() {
        let data = SaveDataset::parse_csv("keeper,saved\noblak,1\nneuer,0\noblak,0\n").unwrap();
        assert_eq!(data.groups, vec!["oblak".to_string(), "neuer".to_string()]);

        let order = vec!["neuer".to_string(), "oblak".to_string()];
        let aligned = data.aligned_to(&order).unwrap();
        assert_eq!(aligned.groups, order);
        assert_eq!(aligned.counts(), vec![(0, 1), (1, 1)]);

        assert!(matches!(
            data.aligned_to(&["neuer".to_string(), "sommer".to_string()]),
            Err(Error::DataContract(_))
        ));
        assert!(matches!(
            data.aligned_to(&["neuer".to_string()]),
            Err(Error::DataContract(_))
        ));
    }

    #[test]
    fn test_rejects_out_of_range_group() {
        let err = SaveDataset::new(vec!["a".to_string()], vec![Shot { group: 1, saved: true }]);
        assert!(matches!(err, Err(Error::DataContract(_))));
    }

    #[test]
    fn test_parse_save_csv() {
        let data = SaveDataset::parse_csv("keeper,saved\nneuer,1\ncourtois,0\nneuer,0\n").unwrap();
        assert_eq!(data.groups, vec!["neuer", "courtois"]);
        assert_eq!(data.counts(), vec![(1, 1), (0, 1)]);
    }

    #[test]
    fn test_poll_rejects_decreasing_times() {
        let err = PollDataset::new(vec![0.0, 2.0, 1.0], vec![1, 2, 3], vec![10, 10, 10]);
        assert!(matches!(err, Err(Error::DataContract(_))));
    }

    #[test]
    fn test_stan_json_is_one_based() {
        let value = save_stan_json(&tiny(), Some(0.5));
        assert_eq!(value["group"], json!([1, 2, 1]));
        assert_eq!(value["tau"], json!(0.5));
    }
}
