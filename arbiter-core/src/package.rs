//! Problem packages.
//!
//! A package is an extracted directory tree owned by an internal file:
//!
//! ```text
//! <root>/Simfile
//! <root>/doc/...        statements
//! <root>/check/...      checker sources
//! <root>/prog/...       solution sources
//! <root>/tests/<t>.in   test inputs
//! <root>/tests/<t>.out  correct outputs
//! ```
//!
//! Rewriting a package copies every entry byte-for-byte except the ones
//! explicitly replaced or dropped, so unchanged entries round-trip exactly.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::judge::JudgeReport;
use crate::simfile::{Simfile, SimfileError, TestGroup, TestSpec};

pub const MIN_TIME_LIMIT: Duration = Duration::from_millis(300);
pub const MAX_TIME_LIMIT: Duration = Duration::from_secs(22);
pub const SOLUTION_RUNTIME_COEFFICIENT: f64 = 3.0;

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{0}")]
    Simfile(#[from] SimfileError),
    #[error("package entry does not exist: {0}")]
    MissingEntry(String),
    #[error("invalid package entry path: {0}")]
    InvalidEntry(String),
    #[error("package needs {0}, but it was not provided")]
    MissingMetadata(&'static str),
    #[error("test group {0} is new and has no score; rescoring was not requested")]
    UnscoredGroup(String),
}

fn io_err(path: &Path, source: std::io::Error) -> PackageError {
    PackageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone)]
pub struct Package {
    root: PathBuf,
}

/// Content for a replaced entry in [`Package::rewrite`].
pub enum EntrySource {
    Bytes(Vec<u8>),
    File(PathBuf),
}

impl Package {
    pub fn open(root: impl Into<PathBuf>) -> Result<Package, PackageError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(io_err(
                &root,
                std::io::Error::new(std::io::ErrorKind::NotFound, "package root is not a directory"),
            ));
        }
        Ok(Package { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a relative entry path, rejecting escapes from the root.
    pub fn entry_path(&self, rel: &str) -> Result<PathBuf, PackageError> {
        let rel_path = Path::new(rel);
        let sane = rel_path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if rel.is_empty() || !sane {
            return Err(PackageError::InvalidEntry(rel.to_string()));
        }
        Ok(self.root.join(rel_path))
    }

    pub fn simfile_path(&self) -> PathBuf {
        self.root.join("Simfile")
    }

    pub fn read_simfile_text(&self) -> Result<String, PackageError> {
        let path = self.simfile_path();
        std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))
    }

    pub fn read_simfile(&self) -> Result<Simfile, PackageError> {
        Ok(Simfile::parse(&self.read_simfile_text()?)?)
    }

    pub fn input_path(&self, test: &str) -> PathBuf {
        self.root.join("tests").join(format!("{test}.in"))
    }

    pub fn correct_output_path(&self, test: &str) -> PathBuf {
        self.root.join("tests").join(format!("{test}.out"))
    }

    /// Checks that everything the manifest mentions actually exists.
    pub fn verify(&self, simfile: &Simfile) -> Result<(), PackageError> {
        let mut required = vec![simfile.statement.clone(), simfile.checker.clone()];
        required.extend(simfile.solutions.iter().cloned());
        for rel in required {
            let path = self.entry_path(&rel)?;
            if !path.is_file() {
                return Err(PackageError::MissingEntry(rel));
            }
        }
        for group in &simfile.groups {
            for test in &group.tests {
                if !self.input_path(&test.name).is_file() {
                    return Err(PackageError::MissingEntry(format!("tests/{}.in", test.name)));
                }
            }
        }
        Ok(())
    }

    /// Copies this package into `dest_root`, dropping the entries named in
    /// `remove` and substituting the entries in `replace`. Everything else
    /// is copied byte-identically.
    pub fn rewrite(
        &self,
        dest_root: &Path,
        remove: &[&str],
        replace: &[(&str, EntrySource)],
    ) -> Result<(), PackageError> {
        let removed: Vec<PathBuf> = remove
            .iter()
            .map(|rel| self.entry_path(rel))
            .collect::<Result<_, _>>()?;
        let replaced: Vec<PathBuf> = replace
            .iter()
            .map(|(rel, _)| self.entry_path(rel))
            .collect::<Result<_, _>>()?;

        copy_tree(&self.root, dest_root, &self.root, &removed, &replaced)?;

        for (rel, source) in replace {
            let dest = {
                let relative = Path::new(rel);
                dest_root.join(relative)
            };
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
            match source {
                EntrySource::Bytes(bytes) => {
                    std::fs::write(&dest, bytes).map_err(|e| io_err(&dest, e))?;
                }
                EntrySource::File(path) => {
                    std::fs::copy(path, &dest).map_err(|e| io_err(path, e))?;
                }
            }
        }
        Ok(())
    }
}

fn copy_tree(
    src: &Path,
    dest: &Path,
    root: &Path,
    removed: &[PathBuf],
    replaced: &[PathBuf],
) -> Result<(), PackageError> {
    std::fs::create_dir_all(dest).map_err(|e| io_err(dest, e))?;
    let entries = std::fs::read_dir(src).map_err(|e| io_err(src, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_err(src, e))?;
        let path = entry.path();
        let target = dest.join(entry.file_name());
        if removed.contains(&path) || replaced.contains(&path) {
            continue;
        }
        let file_type = entry.file_type().map_err(|e| io_err(&path, e))?;
        if file_type.is_dir() {
            copy_tree(&path, &target, root, removed, replaced)?;
        } else {
            std::fs::copy(&path, &target).map_err(|e| io_err(&path, e))?;
        }
    }
    Ok(())
}

// ── Simfile construction (package conversion) ──

#[derive(Debug, Clone, Default)]
pub struct ConstructOptions {
    pub name: Option<String>,
    pub label: Option<String>,
    pub memory_limit_mib: Option<u64>,
    /// When set, every test gets this limit and no model-solution judging
    /// is needed.
    pub fixed_time_limit: Option<Duration>,
    /// Re-derive time limits by judging the model solution.
    pub reset_time_limits: bool,
    pub ignore_existing_simfile: bool,
    /// Pick up `tests/*.in` files absent from the manifest.
    pub seek_new_tests: bool,
    /// Redistribute 100 points evenly across scored groups.
    pub reset_scoring: bool,
}

/// Result of [`construct_simfile`]: either a finished manifest or one whose
/// time limits still need the model solution judged against it.
#[derive(Debug, Clone)]
pub enum Construction {
    Complete(Simfile),
    NeedsModelSolutionJudge(Simfile),
}

pub fn construct_simfile(
    pkg: &Package,
    opts: &ConstructOptions,
) -> Result<Construction, PackageError> {
    let mut simfile = if opts.ignore_existing_simfile {
        synthesize_simfile(pkg, opts)?
    } else {
        pkg.read_simfile()?
    };

    if let Some(name) = &opts.name {
        simfile.name = name.clone();
    }
    if let Some(label) = &opts.label {
        simfile.label = label.clone();
    }
    if let Some(mem) = opts.memory_limit_mib {
        simfile.memory_limit_mib = mem;
    }

    if opts.seek_new_tests {
        seek_new_tests(pkg, &mut simfile, opts.reset_scoring)?;
    }
    if opts.reset_scoring {
        reset_scoring(&mut simfile);
    }

    if let Some(limit) = opts.fixed_time_limit {
        for group in &mut simfile.groups {
            for test in &mut group.tests {
                test.time_limit = limit;
            }
        }
    }

    pkg.verify(&simfile)?;

    if opts.reset_time_limits && opts.fixed_time_limit.is_none() {
        // Give the model solution room to run; real limits come from its
        // judge reports.
        for group in &mut simfile.groups {
            for test in &mut group.tests {
                test.time_limit = MAX_TIME_LIMIT;
            }
        }
        return Ok(Construction::NeedsModelSolutionJudge(simfile));
    }
    Ok(Construction::Complete(simfile))
}

fn synthesize_simfile(pkg: &Package, opts: &ConstructOptions) -> Result<Simfile, PackageError> {
    let name = opts
        .name
        .clone()
        .ok_or(PackageError::MissingMetadata("a problem name"))?;
    let label = opts
        .label
        .clone()
        .ok_or(PackageError::MissingMetadata("a problem label"))?;
    let statement = first_entry(pkg, "doc")?.ok_or(PackageError::MissingEntry("doc/".into()))?;
    let checker = first_entry(pkg, "check")?.ok_or(PackageError::MissingEntry("check/".into()))?;
    let solutions = list_entries(pkg, "prog")?;
    if solutions.is_empty() {
        return Err(PackageError::MissingEntry("prog/".into()));
    }
    let mut simfile = Simfile {
        name,
        label,
        statement,
        checker,
        solutions,
        memory_limit_mib: opts
            .memory_limit_mib
            .ok_or(PackageError::MissingMetadata("a memory limit"))?,
        groups: Vec::new(),
    };
    seek_new_tests(pkg, &mut simfile, true)?;
    reset_scoring(&mut simfile);
    Ok(simfile)
}

fn list_entries(pkg: &Package, dir: &str) -> Result<Vec<String>, PackageError> {
    let path = pkg.root().join(dir);
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(&path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(io_err(&path, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| io_err(&path, e))?;
        if entry.file_type().map_err(|e| io_err(&path, e))?.is_file() {
            out.push(format!("{dir}/{}", entry.file_name().to_string_lossy()));
        }
    }
    out.sort();
    Ok(out)
}

fn first_entry(pkg: &Package, dir: &str) -> Result<Option<String>, PackageError> {
    Ok(list_entries(pkg, dir)?.into_iter().next())
}

fn seek_new_tests(
    pkg: &Package,
    simfile: &mut Simfile,
    allow_new_groups: bool,
) -> Result<(), PackageError> {
    let mut discovered: Vec<String> = list_entries(pkg, "tests")?
        .into_iter()
        .filter_map(|rel| {
            rel.strip_prefix("tests/")
                .and_then(|f| f.strip_suffix(".in"))
                .map(str::to_string)
        })
        .collect();
    discovered.sort();

    for test_name in discovered {
        let known = simfile
            .groups
            .iter()
            .any(|g| g.tests.iter().any(|t| t.name == test_name));
        if known {
            continue;
        }
        let (_, gid, _) = crate::simfile::split_test_name(&test_name)?;
        let test = TestSpec {
            name: test_name.clone(),
            time_limit: Duration::from_secs(1),
        };
        match simfile.groups.iter_mut().find(|g| g.id == gid) {
            Some(group) => group.tests.push(test),
            None => {
                let group = TestGroup {
                    id: gid.to_string(),
                    points: 0,
                    tests: vec![test],
                };
                if !group.is_sample() && !allow_new_groups {
                    return Err(PackageError::UnscoredGroup(group.id));
                }
                simfile.groups.push(group);
            }
        }
    }
    Ok(())
}

fn reset_scoring(simfile: &mut Simfile) {
    let scored: Vec<usize> = simfile
        .groups
        .iter()
        .enumerate()
        .filter(|(_, g)| !g.is_sample())
        .map(|(i, _)| i)
        .collect();
    if scored.is_empty() {
        return;
    }
    let share = 100 / scored.len() as i64;
    let remainder = 100 - share * scored.len() as i64;
    for (pos, &idx) in scored.iter().enumerate() {
        simfile.groups[idx].points = share + i64::from(pos == scored.len() - 1) * remainder;
    }
    for group in &mut simfile.groups {
        if group.is_sample() {
            group.points = 0;
        }
    }
}

/// Applies measured model-solution runtimes to a manifest:
/// `limit = clamp(runtime * SOLUTION_RUNTIME_COEFFICIENT)` rounded up to
/// 10 ms. Tests absent from the reports keep their current limit.
pub fn reset_time_limits_using_reports(simfile: &mut Simfile, reports: &[&JudgeReport]) {
    for group in &mut simfile.groups {
        for test in &mut group.tests {
            let runtime = reports.iter().find_map(|report| {
                report
                    .groups
                    .iter()
                    .flat_map(|g| &g.tests)
                    .find(|t| t.name == test.name)
                    .map(|t| t.runtime)
            });
            if let Some(runtime) = runtime {
                let scaled = runtime.mul_f64(SOLUTION_RUNTIME_COEFFICIENT);
                let clamped = scaled.clamp(MIN_TIME_LIMIT, MAX_TIME_LIMIT);
                let ms = clamped.as_millis() as u64;
                test.time_limit = Duration::from_millis(ms.div_ceil(10) * 10);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judge::{GroupReport, TestReport, TestStatus};

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn scaffold_package(root: &Path) {
        write(&root.join("Simfile"), SIMFILE);
        write(&root.join("doc/statement.pdf"), "statement");
        write(&root.join("check/checker.cpp"), "int main() {}");
        write(&root.join("prog/sum.cpp"), "int main() {}");
        write(&root.join("tests/sum0a.in"), "1 2\n");
        write(&root.join("tests/sum0a.out"), "3\n");
        write(&root.join("tests/sum1a.in"), "2 3\n");
        write(&root.join("tests/sum1a.out"), "5\n");
    }

    const SIMFILE: &str = "\
name: Sum
label: sum
statement: doc/statement.pdf
checker: check/checker.cpp
memory_limit: 64
solutions: [prog/sum.cpp]
limits: [
        sum0a 1.00
        sum1a 1.00
]
scoring: [
        1 100
]
";

    #[test]
    fn rewrite_keeps_unchanged_entries_byte_identical() {
        let tmp = tempfile::tempdir().unwrap();
        let src_root = tmp.path().join("pkg");
        scaffold_package(&src_root);
        let pkg = Package::open(&src_root).unwrap();

        let dest = tmp.path().join("pkg2");
        pkg.rewrite(
            &dest,
            &["doc/statement.pdf"],
            &[
                ("Simfile", EntrySource::Bytes(b"replaced".to_vec())),
                ("doc/v2.pdf", EntrySource::Bytes(b"new statement".to_vec())),
            ],
        )
        .unwrap();

        assert_eq!(std::fs::read(dest.join("Simfile")).unwrap(), b"replaced");
        assert_eq!(
            std::fs::read(dest.join("doc/v2.pdf")).unwrap(),
            b"new statement"
        );
        assert!(!dest.join("doc/statement.pdf").exists());
        // Untouched entries round-trip exactly.
        assert_eq!(
            std::fs::read(dest.join("tests/sum1a.in")).unwrap(),
            std::fs::read(src_root.join("tests/sum1a.in")).unwrap()
        );
        assert_eq!(
            std::fs::read(dest.join("prog/sum.cpp")).unwrap(),
            std::fs::read(src_root.join("prog/sum.cpp")).unwrap()
        );
    }

    #[test]
    fn entry_paths_cannot_escape_the_package() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("pkg");
        scaffold_package(&root);
        let pkg = Package::open(&root).unwrap();
        assert!(pkg.entry_path("doc/statement.pdf").is_ok());
        assert!(pkg.entry_path("../outside").is_err());
        assert!(pkg.entry_path("/etc/passwd").is_err());
        assert!(pkg.entry_path("").is_err());
    }

    #[test]
    fn construct_complete_simfile() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("pkg");
        scaffold_package(&root);
        let pkg = Package::open(&root).unwrap();

        let result = construct_simfile(&pkg, &ConstructOptions::default()).unwrap();
        let Construction::Complete(sf) = result else {
            panic!("expected a complete manifest");
        };
        assert_eq!(sf.name, "Sum");
        assert_eq!(sf.groups.len(), 2);
    }

    #[test]
    fn resetting_time_limits_defers_to_model_solution() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("pkg");
        scaffold_package(&root);
        let pkg = Package::open(&root).unwrap();

        let opts = ConstructOptions {
            reset_time_limits: true,
            ..ConstructOptions::default()
        };
        let Construction::NeedsModelSolutionJudge(sf) = construct_simfile(&pkg, &opts).unwrap()
        else {
            panic!("expected model-solution flow");
        };
        assert!(sf
            .groups
            .iter()
            .flat_map(|g| &g.tests)
            .all(|t| t.time_limit == MAX_TIME_LIMIT));
    }

    #[test]
    fn seek_new_tests_picks_up_disk_tests() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("pkg");
        scaffold_package(&root);
        write(&root.join("tests/sum1b.in"), "9 9\n");
        write(&root.join("tests/sum1b.out"), "18\n");
        let pkg = Package::open(&root).unwrap();

        let opts = ConstructOptions {
            seek_new_tests: true,
            ..ConstructOptions::default()
        };
        let Construction::Complete(sf) = construct_simfile(&pkg, &opts).unwrap() else {
            panic!("expected complete");
        };
        let group1 = sf.groups.iter().find(|g| g.id == "1").unwrap();
        assert!(group1.tests.iter().any(|t| t.name == "sum1b"));
    }

    #[test]
    fn time_limits_derive_from_judge_reports() {
        let mut sf = Simfile::parse(SIMFILE).unwrap();
        let report = JudgeReport {
            groups: vec![GroupReport {
                score: 100,
                max_score: 100,
                tests: vec![TestReport {
                    name: "sum1a".into(),
                    status: TestStatus::Ok,
                    runtime: Duration::from_millis(105),
                    time_limit: MAX_TIME_LIMIT,
                    memory_consumed: 1 << 20,
                    memory_limit: 64 << 20,
                    comment: String::new(),
                }],
            }],
        };
        reset_time_limits_using_reports(&mut sf, &[&report]);
        let test = sf
            .groups
            .iter()
            .flat_map(|g| &g.tests)
            .find(|t| t.name == "sum1a")
            .unwrap();
        // 105 ms * 3.0 = 315 ms, rounded up to 10 ms.
        assert_eq!(test.time_limit, Duration::from_millis(320));
        // A test that never ran keeps its limit.
        let untouched = sf
            .groups
            .iter()
            .flat_map(|g| &g.tests)
            .find(|t| t.name == "sum0a")
            .unwrap();
        assert_eq!(untouched.time_limit, Duration::from_secs(1));
    }
}
