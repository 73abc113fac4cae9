//! Reading the time series that the Monte Carlo engine writes for each run.
//!
//! Every run at a condition and rep writes one table per file kind, named
//! `{filebase}-{token}_{rep}.{kind}`. A table is whitespace separated, with a header line of
//! tags whose first column is the Monte Carlo step:
//!
//! ```text
//! step tenergy hybridization stacking
//! 0 -1200.5 -800.0 -400.5
//! 1000 -1250.0 -850.0 -400.0
//! ```

use crate::conditions::ConditionSpace;
use crate::errors::*;
use ndarray::{Array2, ArrayView1, Axis};
use std::ffi::OsString;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// First column of every output table
pub const STEP_COLUMN: &str = "step";
/// Energies, including the total energy
pub const ENERGY_KIND: &str = "ene";
/// Order parameters
pub const ORDER_PARAMS_KIND: &str = "ops";
/// Per-domain bias energies
pub const BIASES_KIND: &str = "biases";

/// Which reps to read for every condition
#[derive(Debug, Clone, PartialEq)]
pub enum RepSelection {
    /// Read exactly these reps; any that are missing is an error
    Explicit(Vec<usize>),
    /// Read every rep that has output; a gap in the rep numbers is an error
    Discover,
}

impl Default for RepSelection {
    fn default() -> Self {
        Self::Discover
    }
}

/// Path of the output table of one run
pub fn run_filepath(filebase: &Path, token: &str, rep: usize, kind: &str) -> PathBuf {
    let mut name = OsString::from(filebase.as_os_str());
    name.push(format!("-{}_{}.{}", token, rep, kind));
    PathBuf::from(name)
}

/// Identifies a single series: one tag of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesId {
    /// File token of the condition
    pub condition: String,
    #[allow(missing_docs)]
    pub rep: usize,
    #[allow(missing_docs)]
    pub tag: String,
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (condition {}, rep {})", self.tag, self.condition, self.rep)
    }
}

/// Values of one tag of one run, in Monte Carlo step order
#[derive(Debug, Clone)]
pub struct RawSeries<'a> {
    #[allow(missing_docs)]
    pub id: SeriesId,
    #[allow(missing_docs)]
    pub values: ArrayView1<'a, f64>,
}

/// All series recorded by one run of one condition
#[derive(Debug, Clone)]
pub struct SimRun {
    condition: usize,
    token: String,
    rep: usize,
    steps: Vec<i64>,
    tags: Vec<String>,
    /// `values[[n, j]]` is sample `n` of tag `j`
    values: Array2<f64>,
}

impl SimRun {
    /// Assemble a run from already loaded series
    pub fn new(
        condition: usize,
        token: impl Into<String>,
        rep: usize,
        steps: Vec<i64>,
        tags: Vec<String>,
        values: Array2<f64>,
    ) -> Result<Self> {
        if values.len_of(Axis(0)) != steps.len() {
            return Err(AnalysisError::ArrayLengthMismatch(
                values.len_of(Axis(0)),
                steps.len(),
            ));
        }
        if values.len_of(Axis(1)) != tags.len() {
            return Err(AnalysisError::ArrayLengthMismatch(
                values.len_of(Axis(1)),
                tags.len(),
            ));
        }

        Ok(Self {
            condition,
            token: token.into(),
            rep,
            steps,
            tags,
            values,
        })
    }

    /// Index of the condition in its space
    pub fn condition(&self) -> usize {
        self.condition
    }

    /// File token of the condition
    pub fn token(&self) -> &str {
        &self.token
    }

    #[allow(missing_docs)]
    pub fn rep(&self) -> usize {
        self.rep
    }

    /// Monte Carlo step of every sample
    pub fn steps(&self) -> &[i64] {
        &self.steps
    }

    /// Recorded tags, in column order
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// `values()[[n, j]]` is sample `n` of tag `j`
    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    #[allow(missing_docs)]
    pub fn tag_index(&self, tag: &str) -> Option<usize> {
        self.tags.iter().position(|t| t == tag)
    }

    /// Identify a series of this run
    pub fn series_id(&self, tag: &str) -> SeriesId {
        SeriesId {
            condition: self.token.clone(),
            rep: self.rep,
            tag: tag.to_string(),
        }
    }

    /// The series recorded for `tag`
    pub fn series(&self, tag: &str) -> Result<RawSeries<'_>> {
        let j = self
            .tag_index(tag)
            .ok_or_else(|| AnalysisError::MissingTag {
                tag: tag.to_string(),
                condition: self.token.clone(),
                rep: self.rep,
            })?;

        Ok(RawSeries {
            id: self.series_id(tag),
            values: self.values.index_axis(Axis(1), j),
        })
    }

    /// Write one table holding every tag of the run
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut writer = table_writer(path)?;
        let header = std::iter::once(STEP_COLUMN).chain(self.tags.iter().map(String::as_str));
        writer
            .write_record(header)
            .map_err(|e| AnalysisError::table(path, e))?;
        for (step, row) in self.steps.iter().zip(self.values.outer_iter()) {
            let record = std::iter::once(step.to_string()).chain(row.iter().map(f64::to_string));
            writer
                .write_record(record)
                .map_err(|e| AnalysisError::table(path, e))?;
        }
        writer.flush().map_err(|e| AnalysisError::io(path, e))
    }
}

/// Space delimited table writer, the layout every table of the analysis shares
pub(crate) fn table_writer(path: &Path) -> Result<csv::Writer<File>> {
    csv::WriterBuilder::new()
        .delimiter(b' ')
        .from_path(path)
        .map_err(|e| AnalysisError::table(path, e))
}

/// One parsed output table
#[derive(Debug)]
struct Table {
    tags: Vec<String>,
    steps: Vec<i64>,
    rows: Vec<Vec<f64>>,
}

fn parse_error(path: &Path, line: usize, message: String) -> AnalysisError {
    AnalysisError::Parse {
        path: path.to_path_buf(),
        line,
        message,
    }
}

fn read_table(path: &Path) -> Result<Table> {
    let file = File::open(path).map_err(|e| AnalysisError::io(path, e))?;
    let mut lines = BufReader::new(file)
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line));

    let tags = loop {
        match lines.next() {
            Some((i, line)) => {
                let line = line.map_err(|e| AnalysisError::io(path, e))?;
                let mut header = line.split_whitespace();
                match header.next() {
                    None => continue,
                    Some(STEP_COLUMN) => break header.map(str::to_string).collect::<Vec<_>>(),
                    Some(other) => {
                        return Err(parse_error(
                            path,
                            i,
                            format!("header starts with {:?}, not {:?}", other, STEP_COLUMN),
                        ))
                    }
                }
            }
            None => return Err(parse_error(path, 0, "file has no header".to_string())),
        }
    };

    let mut steps = Vec::new();
    let mut rows = Vec::new();
    for (i, line) in lines {
        let line = line.map_err(|e| AnalysisError::io(path, e))?;
        let mut fields = line.split_whitespace();
        let step = match fields.next() {
            None => continue,
            Some(step) => step
                .parse::<i64>()
                .map_err(|e| parse_error(path, i, format!("bad step {:?}: {}", step, e)))?,
        };
        let row = fields
            .map(|field| {
                field
                    .parse::<f64>()
                    .map_err(|e| parse_error(path, i, format!("bad value {:?}: {}", field, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        if row.len() != tags.len() {
            return Err(parse_error(
                path,
                i,
                format!("{} values for {} tags", row.len(), tags.len()),
            ));
        }
        steps.push(step);
        rows.push(row);
    }

    Ok(Table { tags, steps, rows })
}

/// Read every kind of table written by one run and join them column-wise
pub fn read_run(
    filebase: &Path,
    space: &ConditionSpace,
    condition: usize,
    rep: usize,
    kinds: &[String],
) -> Result<SimRun> {
    if kinds.is_empty() {
        return Err(AnalysisError::Configuration(
            "no output file kinds to read".to_string(),
        ));
    }
    let token = space.token(condition);

    let mut tables = Vec::with_capacity(kinds.len());
    for kind in kinds {
        let path = run_filepath(filebase, token, rep, kind);
        if !path.is_file() {
            return Err(AnalysisError::DataUnavailable {
                condition: token.to_string(),
                rep,
                path,
            });
        }
        let table = read_table(&path)?;
        tables.push((path, table));
    }

    let (first_path, first) = &tables[0];
    let mut tags: Vec<String> = Vec::new();
    for (path, table) in &tables {
        if table.steps != first.steps {
            return Err(parse_error(
                path,
                0,
                format!(
                    "steps do not match those of {} ({} and {} rows)",
                    first_path.display(),
                    table.steps.len(),
                    first.steps.len()
                ),
            ));
        }
        for tag in &table.tags {
            if tags.contains(tag) {
                return Err(AnalysisError::Configuration(format!(
                    "tag {} is recorded twice for condition {}, rep {}",
                    tag, token, rep
                )));
            }
            tags.push(tag.clone());
        }
    }

    let n = first.steps.len();
    let mut flat = Vec::with_capacity(n * tags.len());
    for i in 0..n {
        for (_, table) in &tables {
            flat.extend_from_slice(&table.rows[i]);
        }
    }
    let values = Array2::from_shape_vec((n, tags.len()), flat)
        .map_err(|e| AnalysisError::Configuration(e.to_string()))?;

    log::debug!(
        "Read {} samples of {} tags for condition {}, rep {}",
        n,
        tags.len(),
        token,
        rep
    );

    SimRun::new(condition, token, rep, first.steps.clone(), tags, values)
}

/// Reps with output of `kind` for a condition, in ascending order
///
/// Every file in the directory of `filebase` named `{filebase}-{token}_{rep}.{kind}` counts.
/// Reps must run from 0 without gaps; the first missing rep is reported as unavailable.
pub fn available_reps(filebase: &Path, token: &str, kind: &str) -> Result<Vec<usize>> {
    let dir = match filebase.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let name = match filebase.file_name().and_then(|name| name.to_str()) {
        Some(name) => name,
        None => return Ok(Vec::new()),
    };
    let prefix = format!("{}-{}_", name, token);
    let suffix = format!(".{}", kind);

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(AnalysisError::io(dir, e)),
    };
    let mut reps = Vec::new();
    for entry in entries {
        let file_name = entry.map_err(|e| AnalysisError::io(dir, e))?.file_name();
        let rep = file_name
            .to_str()
            .and_then(|file_name| file_name.strip_prefix(&prefix))
            .and_then(|rest| rest.strip_suffix(&suffix))
            .filter(|rep| !rep.is_empty() && rep.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|rep| rep.parse::<usize>().ok());
        reps.extend(rep);
    }
    reps.sort_unstable();
    reps.dedup();

    if let Some(missing) = (0..reps.len()).find(|&i| reps[i] != i) {
        return Err(AnalysisError::DataUnavailable {
            condition: token.to_string(),
            rep: missing,
            path: run_filepath(filebase, token, missing, kind),
        });
    }
    Ok(reps)
}

/// Read every selected rep of a condition
///
/// Each rep is returned as its own run; they are decorrelated separately before pooling.
pub fn read_condition_runs(
    filebase: &Path,
    space: &ConditionSpace,
    condition: usize,
    reps: &RepSelection,
    kinds: &[String],
) -> Result<Vec<SimRun>> {
    let token = space.token(condition);
    let reps = match reps {
        RepSelection::Explicit(reps) => reps.clone(),
        RepSelection::Discover => match kinds.first() {
            Some(kind) => available_reps(filebase, token, kind)?,
            None => Vec::new(),
        },
    };
    if reps.is_empty() {
        return Err(AnalysisError::Configuration(format!(
            "no reps available for condition {} under {}",
            token,
            filebase.display()
        )));
    }

    reps.into_iter()
        .map(|rep| read_run(filebase, space, condition, rep, kinds))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::*;
    use ndarray::array;
    use std::fs;
    use tempfile::TempDir;

    fn temp_space() -> ConditionSpace {
        let axes = vec![ConditionAxis::new(TEMP_AXIS, vec![300.0, 320.0])];
        let formatter =
            ConditionsFileformatter::new(vec![FileformatSpec::new(TEMP_AXIS, ValueFormat::Plain)]);
        ConditionSpace::new(axes, formatter).unwrap()
    }

    fn kinds() -> Vec<String> {
        vec![ENERGY_KIND.to_string(), ORDER_PARAMS_KIND.to_string()]
    }

    fn write_outputs(dir: &Path, token: &str, rep: usize) {
        let base = dir.join("sim");
        fs::write(
            run_filepath(&base, token, rep, ENERGY_KIND),
            "step tenergy\n0 -10.5\n100 -11.0\n200 -9.5\n",
        )
        .unwrap();
        fs::write(
            run_filepath(&base, token, rep, ORDER_PARAMS_KIND),
            "step numstackedpairs numfullyboundstaples\n0 1 2\n100 2 2\n\n200 0 3\n",
        )
        .unwrap();
    }

    #[test]
    fn filepath_follows_naming_convention() {
        let path = run_filepath(Path::new("out/sim"), "300-0.5", 2, ENERGY_KIND);
        assert_eq!(path, PathBuf::from("out/sim-300-0.5_2.ene"));
    }

    #[test]
    fn reads_and_joins_file_kinds() {
        let dir = TempDir::new().unwrap();
        let space = temp_space();
        write_outputs(dir.path(), "300", 0);

        let run = read_run(&dir.path().join("sim"), &space, 0, 0, &kinds()).unwrap();
        assert_eq!(run.len(), 3);
        assert_eq!(run.steps(), &[0, 100, 200]);
        assert_eq!(
            run.tags(),
            &["tenergy", "numstackedpairs", "numfullyboundstaples"]
        );
        assert_eq!(run.series("tenergy").unwrap().values, array![-10.5, -11.0, -9.5]);
        assert_eq!(run.series("numfullyboundstaples").unwrap().values, array![2.0, 2.0, 3.0]);
        assert!(matches!(
            run.series("dist-sum"),
            Err(AnalysisError::MissingTag { .. })
        ));
    }

    #[test]
    fn missing_rep_names_condition_and_rep() {
        let dir = TempDir::new().unwrap();
        let space = temp_space();
        write_outputs(dir.path(), "300", 0);

        let err = read_condition_runs(
            &dir.path().join("sim"),
            &space,
            0,
            &RepSelection::Explicit(vec![0, 1]),
            &kinds(),
        )
        .unwrap_err();
        match err {
            AnalysisError::DataUnavailable { condition, rep, .. } => {
                assert_eq!(condition, "300");
                assert_eq!(rep, 1);
            }
            other => panic!("unexpected error {}", other),
        }
    }

    #[test]
    fn discovers_consecutive_reps() {
        let dir = TempDir::new().unwrap();
        let space = temp_space();
        for rep in 0..3 {
            write_outputs(dir.path(), "320", rep);
        }
        // Other conditions and kinds share the directory
        write_outputs(dir.path(), "300", 5);
        fs::write(dir.path().join("sim-320_3.ene.bak"), "").unwrap();

        let runs = read_condition_runs(
            &dir.path().join("sim"),
            &space,
            1,
            &RepSelection::Discover,
            &kinds(),
        )
        .unwrap();
        let reps: Vec<usize> = runs.iter().map(SimRun::rep).collect();
        assert_eq!(reps, vec![0, 1, 2]);
        assert!(runs.iter().all(|run| run.condition() == 1));
    }

    #[test]
    fn gap_in_discovered_reps_is_unavailable_data() {
        let dir = TempDir::new().unwrap();
        let space = temp_space();
        for rep in [0, 1, 2, 4] {
            write_outputs(dir.path(), "320", rep);
        }

        let err = read_condition_runs(
            &dir.path().join("sim"),
            &space,
            1,
            &RepSelection::Discover,
            &kinds(),
        )
        .unwrap_err();
        match err {
            AnalysisError::DataUnavailable {
                condition,
                rep,
                path,
            } => {
                assert_eq!(condition, "320");
                assert_eq!(rep, 3);
                assert_eq!(path, dir.path().join("sim-320_3.ene"));
            }
            other => panic!("unexpected error {}", other),
        }
    }

    #[test]
    fn condition_without_reps_is_a_configuration_error() {
        let dir = TempDir::new().unwrap();
        let space = temp_space();
        let err = read_condition_runs(
            &dir.path().join("sim"),
            &space,
            0,
            &RepSelection::Discover,
            &kinds(),
        )
        .unwrap_err();
        assert!(matches!(err, AnalysisError::Configuration(_)));
    }

    #[test]
    fn mismatched_tables_are_rejected() {
        let dir = TempDir::new().unwrap();
        let space = temp_space();
        let base = dir.path().join("sim");
        fs::write(
            run_filepath(&base, "300", 0, ENERGY_KIND),
            "step tenergy\n0 -10.5\n100 -11.0\n",
        )
        .unwrap();
        fs::write(
            run_filepath(&base, "300", 0, ORDER_PARAMS_KIND),
            "step numstackedpairs\n0 1\n",
        )
        .unwrap();
        assert!(matches!(
            read_run(&base, &space, 0, 0, &kinds()),
            Err(AnalysisError::Parse { .. })
        ));

        fs::write(
            run_filepath(&base, "300", 0, ORDER_PARAMS_KIND),
            "step numstackedpairs\n0 1\n100 x\n",
        )
        .unwrap();
        match read_run(&base, &space, 0, 0, &kinds()) {
            Err(AnalysisError::Parse { line, .. }) => assert_eq!(line, 3),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn written_runs_read_back() {
        let dir = TempDir::new().unwrap();
        let space = temp_space();
        let base = dir.path().join("sim");
        let run = SimRun::new(
            1,
            "320",
            0,
            vec![0, 10],
            vec!["tenergy".to_string(), "numstaples".to_string()],
            array![[-1.25, 3.0], [-2.5, 4.0]],
        )
        .unwrap();
        run.write(&run_filepath(&base, "320", 0, ENERGY_KIND)).unwrap();

        let read = read_run(&base, &space, 1, 0, &[ENERGY_KIND.to_string()]).unwrap();
        assert_eq!(read.values(), run.values());
        assert_eq!(read.steps(), run.steps());
    }
}
