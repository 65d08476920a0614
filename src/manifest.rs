//! Text snapshot manifests.
//!
//! A snapshot directory holds `tree.meta`, listing one per-level manifest
//! file per line, oldest level last. Each level manifest holds one line per
//! run, oldest run first:
//!
//! ```text
//! memory <file> <record_count> <tombstone_count>
//! ```
//!
//! Run data files are fixed-width record arrays with a trailing CRC32.
//! Reload rebuilds each run from its data file and cross-checks the counts
//! against the manifest entry.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::config::{DeletePolicy, MergePolicy, TreeConfig};
use crate::errdata;
use crate::error::Result;
use crate::level::Level;
use crate::run::Run;

const TREE_MANIFEST: &str = "tree.meta";

pub(crate) fn persist(levels: &[Arc<Level>], dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;

    let mut tree_lines = String::new();
    for level in levels {
        let meta_name = format!("level{}.meta", level.level_no());
        let mut run_lines = String::new();
        for (run_idx, run) in level.runs().iter().enumerate() {
            let data_name = format!("level{}_run{}.dat", level.level_no(), run_idx);
            run.persist_to(dir.join(&data_name))?;
            run_lines.push_str(&format!(
                "memory {} {} {}\n",
                data_name,
                run.record_count(),
                run.tombstone_count()
            ));
        }
        fs::write(dir.join(&meta_name), run_lines)?;
        tree_lines.push_str(&meta_name);
        tree_lines.push('\n');
    }
    fs::write(dir.join(TREE_MANIFEST), tree_lines)?;
    Ok(())
}

pub(crate) fn load(config: &TreeConfig) -> Result<Vec<Arc<Level>>> {
    let dir = &config.dir;
    let tree_meta = fs::read_to_string(dir.join(TREE_MANIFEST))?;

    let run_cap = match config.merge_policy {
        MergePolicy::Leveling => 1,
        MergePolicy::Tiering => config.scale_factor,
    };
    let tagging = config.delete_policy == DeletePolicy::Tagging;

    let mut levels = Vec::new();
    for (level_no, meta_name) in tree_meta
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
    {
        let level_meta = fs::read_to_string(dir.join(meta_name))?;
        let mut runs = Vec::new();
        for line in level_meta
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
        {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 4 || fields[0] != "memory" {
                return Err(errdata!("malformed manifest line {line:?} in {meta_name}"));
            }
            let file = fields[1];
            let record_count: usize = fields[2]
                .parse()
                .map_err(|_| errdata!("bad record count in manifest line {line:?}"))?;
            let tombstone_count: usize = fields[3]
                .parse()
                .map_err(|_| errdata!("bad tombstone count in manifest line {line:?}"))?;

            let run = Run::load(
                dir.join(file),
                config.bloom_fpr,
                config.bloom_hash_count,
                tagging,
            )?;
            if run.record_count() != record_count || run.tombstone_count() != tombstone_count {
                return Err(errdata!(
                    "run file {file} does not match its manifest entry: \
                     {}/{} records, {}/{} tombstones",
                    run.record_count(),
                    record_count,
                    run.tombstone_count(),
                    tombstone_count
                ));
            }
            runs.push(Arc::new(run));
        }
        levels.push(Arc::new(Level::from_runs(level_no, run_cap, runs)?));
    }

    tracing::info!(
        dir = %dir.display(),
        levels = levels.len(),
        "loaded tree snapshot"
    );
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memtable::Memtable;
    use crate::tmpfs::TempDir;

    fn level_of(level_no: usize, entries: &[(u64, u64, bool)]) -> Arc<Level> {
        let mt = Memtable::new(entries.len().max(1), entries.len().max(1), 0.01, 3, false);
        for &(key, value, tombstone) in entries {
            assert!(mt.append(key, value, 1.0, tombstone));
        }
        let run = Arc::new(Run::from_memtable(&mt, 0.01, 3, false));
        Arc::new(Level::from_runs(level_no, 4, vec![run]).unwrap())
    }

    #[test]
    fn test_persist_load_round_trip() {
        let temp_dir = TempDir::new().expect("temp dir");
        let config = TreeConfig::new(temp_dir.path()).scale_factor(4);

        let levels = vec![
            level_of(0, &[(1, 1, false), (2, 2, false), (9, 9, true)]),
            level_of(1, &[(3, 3, false), (4, 4, false)]),
        ];
        persist(&levels, temp_dir.path()).unwrap();

        let loaded = load(&config).unwrap();
        assert_eq!(loaded.len(), 2);
        for (before, after) in levels.iter().zip(&loaded) {
            assert_eq!(before.level_no(), after.level_no());
            assert_eq!(before.record_count(), after.record_count());
            assert_eq!(before.tombstone_count(), after.tombstone_count());
            for (run_a, run_b) in before.runs().iter().zip(after.runs()) {
                assert_eq!(run_a.records(), run_b.records());
            }
        }
    }

    #[test]
    fn test_manifest_format() {
        let temp_dir = TempDir::new().expect("temp dir");
        let levels = vec![level_of(0, &[(1, 1, false), (2, 2, true)])];
        persist(&levels, temp_dir.path()).unwrap();

        let tree_meta = fs::read_to_string(temp_dir.path().join("tree.meta")).unwrap();
        assert_eq!(tree_meta, "level0.meta\n");

        let level_meta = fs::read_to_string(temp_dir.path().join("level0.meta")).unwrap();
        assert_eq!(level_meta, "memory level0_run0.dat 2 1\n");
    }

    #[test]
    fn test_load_rejects_count_mismatch() {
        let temp_dir = TempDir::new().expect("temp dir");
        let config = TreeConfig::new(temp_dir.path());

        let levels = vec![level_of(0, &[(1, 1, false)])];
        persist(&levels, temp_dir.path()).unwrap();

        // Tamper with the manifest's record count.
        fs::write(
            temp_dir.path().join("level0.meta"),
            "memory level0_run0.dat 7 0\n",
        )
        .unwrap();
        assert!(load(&config).is_err());
    }

    #[test]
    fn test_load_missing_manifest() {
        let temp_dir = TempDir::new().expect("temp dir");
        let config = TreeConfig::new(temp_dir.path());
        assert!(load(&config).is_err());
    }
}
