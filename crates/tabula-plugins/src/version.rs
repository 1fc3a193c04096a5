//! Version parsing and dependency constraints
//!
//! Versions are parsed leniently (`1`, `1.2`, `v1.2.3-rc.1`) and normalised
//! to [`semver::Version`], so pre-releases order below their release.
//!
//! Constraint operators: `>=`, `<=`, `==`, `>`, `<`, `~=`. `==1.*` matches any
//! `1.x.y`. `~=X.Y` is a compatible release, equivalent to `>=X.Y, ==X.*`.
//! Several constraints may be joined with commas and must all hold.

use semver::Version;
use std::fmt;
use std::str::FromStr;

use crate::{PluginError, PluginResult};

/// Parse a version string, padding missing minor/patch components with zero
pub fn parse_version(input: &str) -> PluginResult<Version> {
    let trimmed = input.trim();
    let trimmed = trimmed.strip_prefix(['v', 'V']).unwrap_or(trimmed);
    if trimmed.is_empty() {
        return Err(PluginError::InvalidVersion(input.to_string()));
    }

    let (core, suffix) = match trimmed.find(['-', '+']) {
        Some(idx) => trimmed.split_at(idx),
        None => (trimmed, ""),
    };

    let parts: Vec<&str> = core.split('.').collect();
    if parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(PluginError::InvalidVersion(input.to_string()));
    }

    let mut padded = parts.join(".");
    for _ in parts.len()..3 {
        padded.push_str(".0");
    }
    padded.push_str(suffix);

    Version::parse(&padded).map_err(|e| PluginError::InvalidVersion(format!("{input}: {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Ge,
    Le,
    Eq,
    Gt,
    Lt,
    /// `~=`
    Compatible,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::Eq => "==",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Compatible => "~=",
        }
    }
}

/// A single `<op><version>` clause
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConstraint {
    pub op: Operator,
    pub version: Version,
    /// Number of numeric components written (`1.2` -> 2)
    precision: usize,
    /// `==1.2.*`
    wildcard: bool,
}

impl VersionConstraint {
    pub fn new(op: Operator, version: Version) -> Self {
        Self {
            op,
            version,
            precision: 3,
            wildcard: false,
        }
    }

    /// Whether `candidate` satisfies this clause
    pub fn matches(&self, candidate: &Version) -> bool {
        use std::cmp::Ordering::*;

        let ord = candidate.cmp_precedence(&self.version);
        match self.op {
            Operator::Ge => ord != Less,
            Operator::Le => ord != Greater,
            Operator::Gt => ord == Greater,
            Operator::Lt => ord == Less,
            Operator::Eq if self.wildcard => prefix_eq(candidate, &self.version, self.precision),
            Operator::Eq => ord == Equal,
            Operator::Compatible => {
                ord != Less && prefix_eq(candidate, &self.version, self.precision - 1)
            }
        }
    }

    /// Concrete version named by the clause, if it names one
    pub fn pinned(&self) -> Option<&Version> {
        (!self.wildcard).then_some(&self.version)
    }
}

fn prefix_eq(a: &Version, b: &Version, components: usize) -> bool {
    let a = [a.major, a.minor, a.patch];
    let b = [b.major, b.minor, b.patch];
    a[..components.min(3)] == b[..components.min(3)]
}

impl FromStr for VersionConstraint {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (op, rest) = [
            ("~=", Operator::Compatible),
            (">=", Operator::Ge),
            ("<=", Operator::Le),
            ("==", Operator::Eq),
            (">", Operator::Gt),
            ("<", Operator::Lt),
        ]
        .into_iter()
        .find_map(|(prefix, op)| s.strip_prefix(prefix).map(|rest| (op, rest.trim())))
        .unwrap_or((Operator::Eq, s));

        let (text, wildcard) = match rest.strip_suffix(".*") {
            Some(head) if op == Operator::Eq => (head, true),
            Some(_) => {
                return Err(PluginError::InvalidVersion(format!(
                    "wildcards are only valid with '==': {s}"
                )));
            }
            None => (rest, false),
        };

        let version = parse_version(text)?;
        let precision = text
            .split(['-', '+'])
            .next()
            .map_or(3, |core| core.split('.').count());

        if op == Operator::Compatible && precision < 2 {
            return Err(PluginError::InvalidVersion(format!(
                "'~=' needs at least major.minor: {s}"
            )));
        }

        Ok(Self {
            op,
            version,
            precision,
            wildcard,
        })
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = [self.version.major, self.version.minor, self.version.patch];
        let shown = parts[..self.precision.min(3)]
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(".");
        write!(f, "{}{}", self.op.as_str(), shown)?;
        if self.precision >= 3 && !self.version.pre.is_empty() {
            write!(f, "-{}", self.version.pre)?;
        }
        if self.wildcard {
            f.write_str(".*")?;
        }
        Ok(())
    }
}

/// A declared dependency: `name`, `name>=1.0,<2`, `name~=2.1 ; optional`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencySpec {
    pub name: String,
    /// Empty means any version
    pub constraints: Vec<VersionConstraint>,
    pub optional: bool,
}

impl DependencySpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constraints: Vec::new(),
            optional: false,
        }
    }

    pub fn with_constraint(mut self, constraint: VersionConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.constraints.iter().all(|c| c.matches(version))
    }

    /// Constraint list as written, or `*`
    pub fn requirement(&self) -> String {
        if self.constraints.is_empty() {
            return "*".to_string();
        }
        self.constraints
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl FromStr for DependencySpec {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut sections = s.split(';');
        let main = sections.next().unwrap_or_default().trim();
        let mut optional = false;
        for marker in sections {
            match marker.trim() {
                "optional" => optional = true,
                "" => {}
                other => {
                    return Err(PluginError::InvalidVersion(format!(
                        "unknown dependency marker '{other}' in '{s}'"
                    )));
                }
            }
        }

        let split = main.find(['<', '>', '=', '~']).unwrap_or(main.len());
        let (name, rest) = main.split_at(split);
        let name = name.trim();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(PluginError::InvalidVersion(format!(
                "invalid dependency name in '{s}'"
            )));
        }

        let constraints = rest
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::parse)
            .collect::<PluginResult<Vec<VersionConstraint>>>()?;

        Ok(Self {
            name: name.to_string(),
            constraints,
            optional,
        })
    }
}

impl fmt::Display for DependencySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.constraints.is_empty() {
            f.write_str(&self.requirement())?;
        }
        if self.optional {
            f.write_str(" ; optional")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        parse_version(s).expect("version")
    }

    fn c(s: &str) -> VersionConstraint {
        s.parse().expect("constraint")
    }

    #[test]
    fn test_lenient_versions() {
        assert_eq!(v("1"), Version::new(1, 0, 0));
        assert_eq!(v("v1.2"), Version::new(1, 2, 0));
        assert_eq!(v(" 1.2.3 "), Version::new(1, 2, 3));
        assert!(v("1.0.0-rc.1") < v("1.0.0"));
        assert!(parse_version("").is_err());
        assert!(parse_version("1..2").is_err());
        assert!(parse_version("1.2.3.4").is_err());
        assert!(parse_version("one").is_err());
    }

    #[test]
    fn test_comparison_operators() {
        assert!(c(">=1.2").matches(&v("1.2.0")));
        assert!(!c(">1.2").matches(&v("1.2.0")));
        assert!(c("<2").matches(&v("1.99.0")));
        assert!(c("<=2").matches(&v("2.0.0")));
        assert!(c("==1.4.1").matches(&v("1.4.1")));
        assert!(!c("==1.4.1").matches(&v("1.4.2")));
        assert!(c("1.4").matches(&v("1.4.0")));
    }

    #[test]
    fn test_prerelease_has_lower_precedence() {
        assert!(!c(">=1.0").matches(&v("1.0.0-beta")));
        assert!(c("<1.0").matches(&v("1.0.0-beta")));
    }

    #[test]
    fn test_wildcard_and_compatible_release() {
        assert!(c("==1.*").matches(&v("1.9.3")));
        assert!(!c("==1.*").matches(&v("2.0.0")));
        assert!(c("==1.2.*").matches(&v("1.2.7")));
        assert!(!c("==1.2.*").matches(&v("1.3.0")));

        assert!(c("~=2.1").matches(&v("2.5.0")));
        assert!(!c("~=2.1").matches(&v("2.0.9")));
        assert!(!c("~=2.1").matches(&v("3.0.0")));
        assert!(c("~=2.1.3").matches(&v("2.1.9")));
        assert!(!c("~=2.1.3").matches(&v("2.2.0")));

        assert!("~=2".parse::<VersionConstraint>().is_err());
        assert!(">=1.*".parse::<VersionConstraint>().is_err());
    }

    #[test]
    fn test_dependency_spec_parsing() {
        let spec: DependencySpec = "formatter".parse().expect("bare");
        assert_eq!(spec.name, "formatter");
        assert!(spec.constraints.is_empty());
        assert!(spec.matches(&v("0.0.1")));

        let spec: DependencySpec = "stats >=1.0, <2.0".parse().expect("range");
        assert_eq!(spec.name, "stats");
        assert!(spec.matches(&v("1.5")));
        assert!(!spec.matches(&v("2.0")));
        assert!(!spec.optional);

        let spec: DependencySpec = "charts~=2.1 ; optional".parse().expect("optional");
        assert!(spec.optional);
        assert_eq!(spec.to_string(), "charts~=2.1 ; optional");

        assert!("".parse::<DependencySpec>().is_err());
        assert!(">=1.0".parse::<DependencySpec>().is_err());
        assert!("x ; sometimes".parse::<DependencySpec>().is_err());
    }

    #[test]
    fn test_requirement_rendering() {
        assert_eq!(DependencySpec::new("a").requirement(), "*");
        let spec: DependencySpec = "a>=1.0,<2".parse().expect("spec");
        assert_eq!(spec.requirement(), ">=1.0,<2");
        assert_eq!(c("==1.2.*").to_string(), "==1.2.*");
    }
}
