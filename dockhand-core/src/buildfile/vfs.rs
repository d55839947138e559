//! Virtual filesystem view of a build.
//!
//! Replays the `COPY` instructions of the stages a build actually uses to
//! answer one question: for a path inside the container, which host path
//! produced it? Directory copies are expanded to their immediate and
//! one-level-nested contents against the build context so that `COPY . .`
//! still lets us find `package.json`, even inside a nested service
//! directory, without walking the whole tree.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::{BuildFile, Stage};

/// Directories never expanded when replaying a directory copy.
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git"];

/// Container-path to host-path mapping derived from a build file.
#[derive(Debug, Clone, Default)]
pub struct VirtualFs {
    /// Absolute container path to path relative to the build context.
    entries: BTreeMap<PathBuf, PathBuf>,
}

impl VirtualFs {
    /// Replay the stages used by `target` against `context_dir` (the host
    /// build context). Stage-to-stage copies resolve through the producing
    /// stage's own mapping.
    pub fn from_build(file: &BuildFile, target: Option<&str>, context_dir: &Path) -> Self {
        let mut per_stage: BTreeMap<usize, VirtualFs> = BTreeMap::new();

        for stage in file.used_stages(target) {
            let idx = file
                .stages
                .iter()
                .position(|s| std::ptr::eq(s, stage))
                .unwrap_or(0);
            let mut fs = VirtualFs::default();

            // A stage built FROM another stage inherits its filesystem.
            if let Some(parent_idx) = file
                .stages
                .iter()
                .position(|s| s.name.as_deref() == Some(stage.from.as_str()))
            {
                if let Some(parent) = per_stage.get(&parent_idx) {
                    fs.entries = parent.entries.clone();
                }
            }

            fs.replay_stage(stage, file, &per_stage, context_dir);
            per_stage.insert(idx, fs);
        }

        let final_idx = file
            .final_stage(target)
            .and_then(|s| file.stages.iter().position(|c| std::ptr::eq(c, s)))
            .unwrap_or(0);
        per_stage.remove(&final_idx).unwrap_or_default()
    }

    fn replay_stage(
        &mut self,
        stage: &Stage,
        file: &BuildFile,
        per_stage: &BTreeMap<usize, VirtualFs>,
        context_dir: &Path,
    ) {
        let workdir = inherited_workdir(file, stage).unwrap_or_else(|| "/".to_string());
        let workdir = workdir.as_str();

        for copy in &stage.copies {
            let dest = absolutize(&copy.dest, workdir);

            match &copy.from_stage {
                Some(from_name) => {
                    // Map through the producing stage back to host paths.
                    let source_fs = file
                        .stages
                        .iter()
                        .position(|s| s.name.as_deref() == Some(from_name.as_str()))
                        .and_then(|idx| per_stage.get(&idx));
                    let Some(source_fs) = source_fs else { continue };

                    for src in &copy.sources {
                        if let Some(host) = source_fs.host_relative(Path::new(src)) {
                            self.insert_copy(src, &dest, copy.sources.len(), &host, context_dir);
                        }
                    }
                }
                None => {
                    for src in &copy.sources {
                        let host = PathBuf::from(src.trim_start_matches("./"));
                        self.insert_copy(src, &dest, copy.sources.len(), &host, context_dir);
                    }
                }
            }
        }
    }

    fn insert_copy(
        &mut self,
        src: &str,
        dest: &Path,
        source_count: usize,
        host: &Path,
        context_dir: &Path,
    ) {
        let src_trimmed = src.trim_start_matches("./").trim_end_matches('/');
        let host_abs = context_dir.join(host);
        let is_dir = src_trimmed.is_empty() || src_trimmed == "." || host_abs.is_dir();

        // With multiple sources, or a trailing slash, dest is a directory the
        // sources land inside. A single file source maps straight to dest.
        let container_path = if is_dir {
            dest.to_path_buf()
        } else if source_count > 1 || src.ends_with('/') || dest_is_dir_like(dest) {
            dest.join(file_name(src_trimmed))
        } else {
            dest.to_path_buf()
        };

        let host_rel = if src_trimmed.is_empty() || src_trimmed == "." {
            PathBuf::new()
        } else {
            host.to_path_buf()
        };

        self.entries.insert(container_path.clone(), host_rel.clone());

        // Immediate and one-level-nested entries so a manifest sitting one
        // directory below the copy root still resolves precisely.
        if is_dir {
            let base = if host_rel.as_os_str().is_empty() {
                context_dir.to_path_buf()
            } else {
                context_dir.join(&host_rel)
            };
            self.expand_dir(&base, &container_path, &host_rel, 0);
        }
    }

    fn expand_dir(&mut self, base: &Path, container: &Path, host_rel: &Path, depth: usize) {
        let Ok(read_dir) = std::fs::read_dir(base) else { return };
        for entry in read_dir.flatten() {
            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            if SKIPPED_DIRS.contains(&name_str.as_ref()) || name_str.starts_with('.') {
                continue;
            }
            let child_container = container.join(&name);
            let child_host = host_rel.join(&name);
            self.entries.insert(child_container.clone(), child_host.clone());
            if depth == 0 && entry.path().is_dir() {
                self.expand_dir(&entry.path(), &child_container, &child_host, depth + 1);
            }
        }
    }

    /// Host path (relative to the build context) for a container path, by
    /// longest matching prefix.
    pub fn host_relative(&self, container_path: &Path) -> Option<PathBuf> {
        let mut best: Option<(&PathBuf, &PathBuf)> = None;
        for (c, h) in &self.entries {
            if container_path.starts_with(c)
                && best.map(|(bc, _)| c.components().count() > bc.components().count()).unwrap_or(true)
            {
                best = Some((c, h));
            }
        }
        let (c, h) = best?;
        let tail = container_path.strip_prefix(c).ok()?;
        Some(h.join(tail))
    }

    /// Absolute host path for a container path.
    pub fn host_path(&self, container_path: &Path, context_dir: &Path) -> Option<PathBuf> {
        self.host_relative(container_path).map(|rel| context_dir.join(rel))
    }

    /// Container paths currently mapped, for diagnostics.
    pub fn container_paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.entries.keys()
    }
}

/// Working directory of a stage, following its FROM chain when the stage
/// declares none of its own.
fn inherited_workdir(file: &BuildFile, stage: &Stage) -> Option<String> {
    let mut current = stage;
    loop {
        if let Some(wd) = &current.workdir {
            return Some(wd.clone());
        }
        match file.stages.iter().find(|s| s.name.as_deref() == Some(current.from.as_str())) {
            Some(parent) => current = parent,
            None => return None,
        }
    }
}

fn absolutize(path: &str, workdir: &str) -> PathBuf {
    let trimmed = path.trim_end_matches('/');
    let rel = trimmed.trim_start_matches("./");
    if rel.starts_with('/') {
        PathBuf::from(rel)
    } else if rel.is_empty() || rel == "." {
        PathBuf::from(workdir)
    } else {
        Path::new(workdir).join(rel)
    }
}

fn dest_is_dir_like(dest: &Path) -> bool {
    dest.extension().is_none()
}

fn file_name(src: &str) -> &str {
    src.rsplit('/').next().unwrap_or(src)
}
