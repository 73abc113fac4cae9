//! The space of simulated thermodynamic states and the file tokens that name them.

use crate::biases::Bias;
use crate::errors::*;
use itertools::Itertools;
use std::collections::HashMap;
use std::fmt;

/// Axis holding the temperature (K)
pub const TEMP_AXIS: &str = "temp";
/// Axis holding the staple molarity (mol/L)
pub const STAPLE_AXIS: &str = "staple_m";
/// Axis holding the bias applied at a condition
pub const BIAS_AXIS: &str = "bias";

/// Avogadro's number (1/mol)
pub const AVOGADRO: f64 = 6.022_140_76e23;

/// Reduced chemical potential of staples at molarity `staple_m`
///
/// This is the log of the number of staples per lattice site, the fugacity that cancels the
/// volume of the box. `lattice_site_volume` is in m³.
pub fn staple_chemical_potential(staple_m: f64, lattice_site_volume: f64) -> f64 {
    // 1e3 L per m³
    (staple_m * AVOGADRO * lattice_site_volume * 1e3).ln()
}

/// The value of one axis at a condition
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AxisValue {
    /// A plain number, such as a temperature or a molarity
    Number(f64),
    /// A bias potential
    Bias(Bias),
}

impl AxisValue {
    fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(x) => Some(*x),
            Self::Bias(_) => None,
        }
    }

    /// Number rendered into file tokens for this value
    pub fn file_value(&self) -> Option<f64> {
        match self {
            Self::Number(x) => Some(*x),
            Self::Bias(bias) => bias.file_value(),
        }
    }
}

impl From<f64> for AxisValue {
    fn from(x: f64) -> Self {
        Self::Number(x)
    }
}

impl From<Bias> for AxisValue {
    fn from(bias: Bias) -> Self {
        Self::Bias(bias)
    }
}

impl fmt::Display for AxisValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(x) => write!(f, "{}", x),
            Self::Bias(bias) => write!(f, "{}", bias),
        }
    }
}

/// A named list of values that one condition variable takes
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionAxis {
    /// Name of the axis, e.g. [`TEMP_AXIS`]
    pub name: String,
    /// Values in the order they are enumerated
    pub values: Vec<AxisValue>,
}

impl ConditionAxis {
    #[allow(missing_docs)]
    pub fn new<V: Into<AxisValue>>(
        name: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// One simulated thermodynamic state
///
/// Conditions can only be created by a [`ConditionSpace`], which guarantees that the axis set
/// is the same for every condition and that the temperature is present and positive.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    values: Vec<(String, AxisValue)>,
    temp: f64,
    staple_m: Option<f64>,
    bias: Bias,
}

impl Condition {
    fn new(names: &[&str], values: Vec<AxisValue>) -> Result<Self> {
        let mut temp = None;
        let mut staple_m = None;
        let mut bias = Bias::NoBias;
        for (name, value) in names.iter().zip(values.iter()) {
            match (*name, value) {
                (TEMP_AXIS, AxisValue::Number(t)) if *t > 0.0 => temp = Some(*t),
                (STAPLE_AXIS, AxisValue::Number(m)) if *m > 0.0 => staple_m = Some(*m),
                (BIAS_AXIS, AxisValue::Bias(b)) => bias = *b,
                (TEMP_AXIS, _) | (STAPLE_AXIS, _) | (BIAS_AXIS, _) => {
                    return Err(AnalysisError::Configuration(format!(
                        "{} is not a valid value for axis {}",
                        value, name
                    )))
                }
                (_, AxisValue::Bias(b)) => {
                    return Err(AnalysisError::Configuration(format!(
                        "bias {} given on axis {}; biases belong on axis {}",
                        b, name, BIAS_AXIS
                    )))
                }
                _ => {}
            }
        }

        let temp = temp.ok_or_else(|| {
            AnalysisError::Configuration(format!("conditions need a {} axis", TEMP_AXIS))
        })?;

        Ok(Self {
            values: names
                .iter()
                .map(|name| name.to_string())
                .zip(values)
                .collect(),
            temp,
            staple_m,
            bias,
        })
    }

    /// Value of the named axis
    pub fn get(&self, axis: &str) -> Option<&AxisValue> {
        self.values
            .iter()
            .find(|(name, _)| name == axis)
            .map(|(_, value)| value)
    }

    /// Axis names and values in axis order
    pub fn axis_values(&self) -> impl Iterator<Item = (&str, &AxisValue)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Temperature (K)
    pub fn temp(&self) -> f64 {
        self.temp
    }

    /// Staple molarity (mol/L), if the space has a staple axis
    pub fn staple_m(&self) -> Option<f64> {
        self.staple_m
    }

    /// The bias applied at this condition
    pub fn bias(&self) -> &Bias {
        &self.bias
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .values
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .join(", ");
        write!(f, "{}", rendered)
    }
}

/// How a value is rendered into a file token
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueFormat {
    /// Shortest representation, `300` or `302.5`
    Plain,
    /// Integral values only, `300`
    Integer,
    /// Fixed number of decimals, `Fixed(1)` renders `0.5` as `0.5` and `1` as `1.0`
    Fixed(usize),
}

impl ValueFormat {
    fn render(&self, x: f64) -> Option<String> {
        match self {
            Self::Plain => Some(format!("{}", x)),
            Self::Integer if x.is_finite() && x.fract() == 0.0 => Some(format!("{}", x as i64)),
            Self::Integer => None,
            Self::Fixed(decimals) => Some(format!("{:.*}", decimals, x)),
        }
    }
}

/// Format of one axis in the file token
#[derive(Debug, Clone, PartialEq)]
pub struct FileformatSpec {
    #[allow(missing_docs)]
    pub axis: String,
    #[allow(missing_docs)]
    pub format: ValueFormat,
}

impl FileformatSpec {
    #[allow(missing_docs)]
    pub fn new(axis: impl Into<String>, format: ValueFormat) -> Self {
        Self {
            axis: axis.into(),
            format,
        }
    }
}

/// Renders conditions into the tokens used in simulation output file names
///
/// Only axes with a spec appear in the token, in spec order, joined with `-`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConditionsFileformatter {
    specs: Vec<FileformatSpec>,
}

impl ConditionsFileformatter {
    #[allow(missing_docs)]
    pub fn new(specs: Vec<FileformatSpec>) -> Self {
        Self { specs }
    }

    #[allow(missing_docs)]
    pub fn specs(&self) -> &[FileformatSpec] {
        &self.specs
    }

    /// Render the token of a condition
    pub fn format(&self, condition: &Condition) -> Result<String> {
        let parts = self
            .specs
            .iter()
            .map(|spec| {
                let value = condition.get(&spec.axis).ok_or_else(|| {
                    AnalysisError::Configuration(format!(
                        "no axis {} to format in condition {}",
                        spec.axis, condition
                    ))
                })?;
                value
                    .file_value()
                    .and_then(|x| spec.format.render(x))
                    .ok_or_else(|| {
                        AnalysisError::Configuration(format!(
                            "value {} of axis {} cannot be formatted as {:?}",
                            value, spec.axis, spec.format
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(parts.join("-"))
    }
}

/// Every condition that was simulated
///
/// The conditions are the Cartesian product of the axis values, with the first axis varying
/// slowest.
#[derive(Debug, Clone)]
pub struct ConditionSpace {
    axes: Vec<ConditionAxis>,
    conditions: Vec<Condition>,
    tokens: Vec<String>,
    by_token: HashMap<String, usize>,
    formatter: ConditionsFileformatter,
}

impl ConditionSpace {
    /// Enumerate the conditions of `axes` and render their tokens with `formatter`
    pub fn new(axes: Vec<ConditionAxis>, formatter: ConditionsFileformatter) -> Result<Self> {
        for (i, axis) in axes.iter().enumerate() {
            if axis.values.is_empty() {
                return Err(AnalysisError::Configuration(format!(
                    "axis {} has no values",
                    axis.name
                )));
            }
            if axes[..i].iter().any(|other| other.name == axis.name) {
                return Err(AnalysisError::Configuration(format!(
                    "axis {} is given twice",
                    axis.name
                )));
            }
        }
        if !axes.iter().any(|axis| axis.name == TEMP_AXIS) {
            return Err(AnalysisError::Configuration(format!(
                "conditions need a {} axis",
                TEMP_AXIS
            )));
        }
        for spec in formatter.specs() {
            if !axes.iter().any(|axis| axis.name == spec.axis) {
                return Err(AnalysisError::Configuration(format!(
                    "format given for unknown axis {}",
                    spec.axis
                )));
            }
        }

        let names: Vec<&str> = axes.iter().map(|axis| axis.name.as_str()).collect();
        let conditions = axes
            .iter()
            .map(|axis| axis.values.iter().copied())
            .multi_cartesian_product()
            .map(|values| Condition::new(&names, values))
            .collect::<Result<Vec<_>>>()?;

        let mut tokens = Vec::with_capacity(conditions.len());
        let mut by_token = HashMap::with_capacity(conditions.len());
        for (i, condition) in conditions.iter().enumerate() {
            let token = formatter.format(condition)?;
            if let Some(&j) = by_token.get(&token) {
                return Err(AnalysisError::Configuration(format!(
                    "conditions ({}) and ({}) share the file token {:?}",
                    conditions[j], condition, token
                )));
            }
            by_token.insert(token.clone(), i);
            tokens.push(token);
        }

        Ok(Self {
            axes,
            conditions,
            tokens,
            by_token,
            formatter,
        })
    }

    /// Number of conditions, $K$
    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    #[allow(missing_docs)]
    pub fn axes(&self) -> &[ConditionAxis] {
        &self.axes
    }

    #[allow(missing_docs)]
    pub fn formatter(&self) -> &ConditionsFileformatter {
        &self.formatter
    }

    #[allow(missing_docs)]
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    #[allow(missing_docs)]
    pub fn iter(&self) -> std::slice::Iter<'_, Condition> {
        self.conditions.iter()
    }

    /// The `k`th condition
    pub fn get(&self, k: usize) -> Option<&Condition> {
        self.conditions.get(k)
    }

    /// File token of the `k`th condition
    pub fn token(&self, k: usize) -> &str {
        &self.tokens[k]
    }

    /// Render the file token of a condition
    pub fn format(&self, condition: &Condition) -> Result<String> {
        self.formatter.format(condition)
    }

    /// The condition named by a file token
    pub fn parse(&self, token: &str) -> Result<&Condition> {
        self.by_token
            .get(token)
            .map(|&k| &self.conditions[k])
            .ok_or_else(|| {
                AnalysisError::Configuration(format!("no condition has the file token {:?}", token))
            })
    }

    /// Index of a condition in the space
    pub fn position(&self, condition: &Condition) -> Option<usize> {
        self.conditions.iter().position(|other| other == condition)
    }

    /// Index of the condition with the given axis values, in axis order
    pub fn lookup(&self, values: &[AxisValue]) -> Option<usize> {
        self.conditions.iter().position(|condition| {
            condition.values.len() == values.len()
                && condition
                    .values
                    .iter()
                    .zip(values)
                    .all(|((_, a), b)| a == b)
        })
    }
}

impl<'a> IntoIterator for &'a ConditionSpace {
    type Item = &'a Condition;
    type IntoIter = std::slice::Iter<'a, Condition>;

    fn into_iter(self) -> Self::IntoIter {
        self.conditions.iter()
    }
}
