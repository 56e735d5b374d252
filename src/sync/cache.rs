use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::error::{CITraceError, Result};
use crate::providers::PipelineId;

/// Identifiers of pipelines that have already been dispatched.
pub type DedupSet = HashSet<PipelineId>;

/// Durable set of processed pipeline ids for one project.
///
/// Each project gets its own plain-text file under the cache directory, one
/// decimal id per line. The file name is the percent-encoded project id
/// (`group/project` → `group%2Fproject.txt`), so distinct ids never share a
/// file. The file
/// is read fully on [`load`](Self::load) and rewritten fully on
/// [`flush`](Self::flush); only the task scanning the project writes to it.
pub struct PipelineCache {
    cache_file: PathBuf,
}

impl PipelineCache {
    /// Opens the cache file for `project_id`, creating the directory and an
    /// empty file if they do not exist yet.
    ///
    /// # Arguments
    ///
    /// * `cache_dir` - Directory holding every project's cache file
    /// * `project_id` - Numeric id or path of the project (e.g., "group/project")
    ///
    /// # Returns
    ///
    /// A handle on the project's cache file. Nothing is read yet.
    ///
    /// # Errors
    ///
    /// Returns `CITraceError::Cache` if the directory or file cannot be created.
    pub fn open(cache_dir: &Path, project_id: &str) -> Result<Self> {
        fs::create_dir_all(cache_dir).map_err(|e| {
            CITraceError::Cache(format!(
                "could not create cache directory {}: {e}",
                cache_dir.display()
            ))
        })?;

        let cache_file = cache_file(cache_dir, project_id);

        open_options()
            .read(true)
            .append(true)
            .create(true)
            .open(&cache_file)
            .map_err(|e| {
                CITraceError::Cache(format!(
                    "could not open cache file {}: {e}",
                    cache_file.display()
                ))
            })?;

        Ok(Self { cache_file })
    }

    pub fn path(&self) -> &Path {
        &self.cache_file
    }

    /// Reads every id in the file.
    ///
    /// Lines that are not decimal ids, including lines that are not valid
    /// UTF-8, are skipped with a warning.
    ///
    /// # Returns
    ///
    /// The set of ids found, empty when the file is missing or empty.
    ///
    /// # Errors
    ///
    /// Returns `CITraceError::Io` if the file exists but cannot be read.
    pub fn load(&self) -> Result<DedupSet> {
        let content = match fs::read(&self.cache_file) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut ids = DedupSet::new();
        for (number, raw) in content.split(|byte| *byte == b'\n').enumerate() {
            let line = match std::str::from_utf8(raw) {
                Ok(line) => line.trim(),
                Err(e) => {
                    warn!(
                        "Skipping cache entry file={} line={}: {e}",
                        self.cache_file.display(),
                        number + 1
                    );
                    continue;
                }
            };
            if line.is_empty() {
                continue;
            }

            match line.parse::<PipelineId>() {
                Ok(id) => {
                    ids.insert(id);
                }
                Err(e) => warn!(
                    "Skipping cache entry file={} line={} value={line:?}: {e}",
                    self.cache_file.display(),
                    number + 1
                ),
            }
        }

        info!(
            "Loaded pipeline cache file={} entries={}",
            self.cache_file.display(),
            ids.len()
        );

        Ok(ids)
    }

    /// Replaces the file contents with `ids`.
    ///
    /// Writes a sibling temp file and renames it over the cache file, so a
    /// crash mid-write leaves the previous contents intact.
    ///
    /// # Arguments
    ///
    /// * `ids` - Every id processed so far, written in ascending order
    ///
    /// # Errors
    ///
    /// Returns `CITraceError::Io` if the temp file cannot be written or renamed.
    pub fn flush(&self, ids: &DedupSet) -> Result<()> {
        let mut sorted: Vec<PipelineId> = ids.iter().copied().collect();
        sorted.sort_unstable();

        let tmp_file = self.cache_file.with_extension("txt.tmp");
        {
            let file = open_options()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_file)?;
            let mut writer = BufWriter::new(file);
            for id in &sorted {
                writeln!(writer, "{id}")?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_file, &self.cache_file)?;

        debug!(
            "Saved {} pipeline ids to cache: {}",
            sorted.len(),
            self.cache_file.display()
        );

        Ok(())
    }

    /// Removes the cache file of a project.
    ///
    /// # Arguments
    ///
    /// * `cache_dir` - Directory holding every project's cache file
    /// * `project_id` - Project whose file is removed
    ///
    /// # Errors
    ///
    /// Returns an error if the cache file cannot be removed.
    pub fn clear(cache_dir: &Path, project_id: &str) -> Result<()> {
        let cache_file = cache_file(cache_dir, project_id);

        if cache_file.exists() {
            fs::remove_file(&cache_file)?;
            info!("Cache cleared: {}", cache_file.display());
        } else {
            info!("No cache file found for project: {project_id}");
        }

        Ok(())
    }
}

fn cache_file(cache_dir: &Path, project_id: &str) -> PathBuf {
    cache_dir.join(format!("{}.txt", urlencoding::encode(project_id)))
}

fn open_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o640);
    }
    options
}
