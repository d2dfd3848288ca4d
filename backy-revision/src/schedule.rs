//! Retention schedule: when the next backup for a job is due, and which
//! old revisions a schedule entitles us to delete.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use backy_api_types::{filter_schedule_tags, BackyError};

use crate::repository::Repository;

/// One schedule entry: how often a tag's backup should run and how many
/// tagged revisions to retain once the interval has been exceeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub interval: String,
    pub keep: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Schedule {
    config: BTreeMap<String, ScheduleEntry>,
    intervals: BTreeMap<String, Duration>,
}

/// Parse a duration string with an optional unit suffix (`w`/`d`/`h`/`m`/`s`,
/// bare integers are seconds).
pub fn parse_duration(duration: &str) -> Result<Duration, BackyError> {
    let (digits, seconds_per_unit) = match duration.chars().last() {
        Some('w') => (&duration[..duration.len() - 1], 7 * 24 * 3600),
        Some('d') => (&duration[..duration.len() - 1], 24 * 3600),
        Some('h') => (&duration[..duration.len() - 1], 3600),
        Some('m') => (&duration[..duration.len() - 1], 60),
        Some('s') => (&duration[..duration.len() - 1], 1),
        _ => (duration, 1),
    };
    let count: i64 = digits
        .parse()
        .map_err(|_| BackyError::Other(anyhow::anyhow!("invalid duration: {duration}")))?;
    Ok(Duration::seconds(count * seconds_per_unit))
}

fn min_date() -> DateTime<Utc> {
    DateTime::<Utc>::MIN_UTC
}

/// Find the next aligned instant at or after `relative`, `spread` seconds
/// offset into each `interval`-sized slot.
pub fn next_in_interval(
    relative: DateTime<Utc>,
    interval: Duration,
    spread: i64,
) -> DateTime<Utc> {
    let relative_secs = (relative - min_date()).num_seconds();
    let interval_secs = interval.num_seconds().max(1);
    let spread = spread.rem_euclid(interval_secs);
    let relative_secs = relative_secs - spread;
    let current_interval = relative_secs.div_euclid(interval_secs);
    let next_secs = (current_interval + 1) * interval_secs + spread;
    min_date() + Duration::seconds(next_secs)
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configure(&mut self, config: BTreeMap<String, ScheduleEntry>) -> Result<(), BackyError> {
        let mut intervals = BTreeMap::new();
        for (tag, entry) in &config {
            intervals.insert(tag.clone(), parse_duration(&entry.interval)?);
        }
        self.config = config;
        self.intervals = intervals;
        Ok(())
    }

    pub fn tags(&self) -> impl Iterator<Item = &String> {
        self.config.keys()
    }

    /// The smallest configured interval across every tag, used by the SLA
    /// calculation (`now - last_clean_backup > 1.5 * min_interval`).
    /// `None` for an unconfigured (tagless) schedule.
    pub fn min_interval(&self) -> Option<Duration> {
        self.intervals.values().copied().min()
    }

    /// The largest configured interval, used as the modulus for a job's
    /// deterministic deadline spread (see `backy_peer::job_spread`).
    pub fn max_interval(&self) -> Option<Duration> {
        self.intervals.values().copied().max()
    }

    /// The next scheduled run: a time and the set of tags it should carry.
    /// Folds in any tags whose interval has already lapsed ("missed"
    /// tags); if those are due and the ideal run is more than five minutes
    /// away, brings the whole run forward to now.
    pub fn next(
        &self,
        relative: DateTime<Utc>,
        spread: i64,
        repository: &Repository,
    ) -> (DateTime<Utc>, HashSet<String>) {
        let (ideal_time, mut tags) = self.next_ideal(relative, spread);
        let missed_tags = self.missed(repository);

        tags.extend(missed_tags.iter().cloned());

        if !missed_tags.is_empty() && !repository.history().is_empty() {
            let grace_period = Duration::seconds(5 * 60);
            if ideal_time > Utc::now() + grace_period {
                return (Utc::now(), missed_tags);
            }
        }
        (ideal_time, tags)
    }

    fn next_ideal(&self, relative: DateTime<Utc>, spread: i64) -> (DateTime<Utc>, HashSet<String>) {
        let mut next_times: HashMap<DateTime<Utc>, HashSet<String>> = HashMap::new();
        for (tag, interval) in &self.intervals {
            let next = next_in_interval(relative, *interval, spread);
            next_times.entry(next).or_default().insert(tag.clone());
        }
        let next_time = *next_times
            .keys()
            .min()
            .expect("schedule configured with at least one tag");
        (next_time, next_times.remove(&next_time).unwrap())
    }

    fn missed(&self, repository: &Repository) -> HashSet<String> {
        let now = Utc::now();
        let mut missing: HashSet<String> = self.config.keys().cloned().collect();
        for (tag, last) in repository.last_by_tag() {
            let Some(interval) = self.intervals.get(&tag) else {
                continue;
            };
            if last > now - *interval {
                missing.remove(&tag);
            }
        }
        missing
    }

    /// Expire revisions per schedule. Three phases: strip schedule tags
    /// beyond their `keep` threshold, strip tags whose schedule entry no
    /// longer exists, then delete any revision left with no tags at all.
    /// Returns the uuids of removed revisions.
    pub fn expire(&self, repository: &mut Repository) -> Result<Vec<String>, BackyError> {
        repository.scan()?;
        let now = Utc::now();

        for (tag, entry) in &self.config {
            let matching = repository.find_revisions(&format!("tag:{tag}"))?;
            if matching.len() < entry.keep {
                continue;
            }
            let interval = self.intervals[tag];
            let keep_threshold = now - interval * entry.keep as i32;
            for idx in &matching[..matching.len() - entry.keep] {
                let rev = repository.revision_mut(*idx);
                if rev.info.timestamp >= keep_threshold {
                    continue;
                }
                rev.info.tags.remove(tag);
                rev.writable()?;
                rev.write()?;
                rev.readonly()?;
            }
        }

        let schedule_tags: HashSet<String> = self.config.keys().cloned().collect();
        for idx in 0..repository.history().len() {
            let rev = repository.revision_mut(idx);
            let expired: HashSet<String> = filter_schedule_tags(&rev.info.tags)
                .difference(&schedule_tags)
                .cloned()
                .collect();
            if !expired.is_empty() {
                for tag in &expired {
                    rev.info.tags.remove(tag);
                }
                rev.writable()?;
                rev.write()?;
                rev.readonly()?;
            }
        }

        let mut removed = Vec::new();
        for idx in (0..repository.history().len()).rev() {
            let rev = repository.revision_mut(idx);
            if !rev.info.tags.is_empty() {
                continue;
            }
            let uuid = rev.uuid().to_string();
            rev.remove()?;
            removed.push(uuid);
        }
        repository.scan()?;
        Ok(removed)
    }

    /// Sort `tags` by their configured interval, smallest first; tags with
    /// no schedule entry sort first of all.
    pub fn sorted_tags(&self, tags: impl IntoIterator<Item = String>) -> Vec<String> {
        let mut pairs: Vec<(String, Duration)> = tags
            .into_iter()
            .map(|tag| {
                let interval = self
                    .intervals
                    .get(&tag)
                    .copied()
                    .unwrap_or_else(Duration::zero);
                (tag, interval)
            })
            .collect();
        pairs.sort_by_key(|(_, interval)| *interval);
        pairs.into_iter().map(|(tag, _)| tag).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(interval: &str, keep: usize) -> ScheduleEntry {
        ScheduleEntry {
            interval: interval.to_string(),
            keep,
        }
    }

    #[test]
    fn parse_duration_understands_suffixes() {
        assert_eq!(parse_duration("1h").unwrap(), Duration::hours(1));
        assert_eq!(parse_duration("2d").unwrap(), Duration::days(2));
        assert_eq!(parse_duration("30").unwrap(), Duration::seconds(30));
    }

    #[test]
    fn next_in_interval_aligns_to_boundaries() {
        let t0 = min_date();
        let next = next_in_interval(t0, Duration::hours(1), 0);
        assert_eq!(next, t0 + Duration::hours(1));
    }

    #[test]
    fn sorted_tags_orders_by_interval() {
        let mut schedule = Schedule::new();
        let mut config = BTreeMap::new();
        config.insert("daily".to_string(), entry("1d", 7));
        config.insert("hourly".to_string(), entry("1h", 24));
        schedule.configure(config).unwrap();

        let sorted = schedule.sorted_tags(vec!["daily".to_string(), "hourly".to_string()]);
        assert_eq!(sorted, vec!["hourly".to_string(), "daily".to_string()]);
    }
}
