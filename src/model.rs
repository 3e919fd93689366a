// src/model.rs

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub};

/// A fractional metric value.
///
/// Integral values are written as YAML integers so that aggregates of
/// whole-number metrics read the same way the analyzer reported them.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd)]
pub struct Metric(pub f64);

impl Serialize for Metric {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value = self.0;
        if value.is_finite() && value.fract() == 0.0 && value.abs() < 9.0e15 {
            serializer.serialize_i64(value as i64)
        } else {
            serializer.serialize_f64(value)
        }
    }
}

impl<'de> Deserialize<'de> for Metric {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        f64::deserialize(deserializer).map(Metric)
    }
}

impl Add for Metric {
    type Output = Metric;
    fn add(self, rhs: Metric) -> Metric {
        Metric(self.0 + rhs.0)
    }
}

impl Sub for Metric {
    type Output = Metric;
    fn sub(self, rhs: Metric) -> Metric {
        Metric(self.0 - rhs.0)
    }
}

impl Neg for Metric {
    type Output = Metric;
    fn neg(self) -> Metric {
        Metric(-self.0)
    }
}

macro_rules! fieldwise {
    ($ty:ident { $($field:ident),+ $(,)? }) => {
        impl Add for $ty {
            type Output = $ty;
            fn add(self, rhs: $ty) -> $ty {
                $ty { $($field: self.$field + rhs.$field),+ }
            }
        }

        impl Sub for $ty {
            type Output = $ty;
            fn sub(self, rhs: $ty) -> $ty {
                $ty { $($field: self.$field - rhs.$field),+ }
            }
        }

        impl Neg for $ty {
            type Output = $ty;
            fn neg(self) -> $ty {
                $ty { $($field: -self.$field),+ }
            }
        }

        impl AddAssign for $ty {
            fn add_assign(&mut self, rhs: $ty) {
                *self = *self + rhs;
            }
        }

        impl Sum for $ty {
            fn sum<I: Iterator<Item = $ty>>(iter: I) -> $ty {
                iter.fold($ty::default(), Add::add)
            }
        }
    };
}

/// Cyclomatic complexity totals for a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Complexity {
    pub class: i64,
    pub func: i64,
    pub total: i64,
}

/// Logical lines of code per complexity grade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Grades {
    #[serde(rename = "A")]
    pub a: i64,
    #[serde(rename = "B")]
    pub b: i64,
    #[serde(rename = "C")]
    pub c: i64,
    #[serde(rename = "D")]
    pub d: i64,
    #[serde(rename = "E")]
    pub e: i64,
    #[serde(rename = "F")]
    pub f: i64,
}

impl Grades {
    pub fn get(&self, grade: Grade) -> i64 {
        match grade {
            Grade::A => self.a,
            Grade::B => self.b,
            Grade::C => self.c,
            Grade::D => self.d,
            Grade::E => self.e,
            Grade::F => self.f,
        }
    }

    pub fn add_lines(&mut self, grade: Grade, lloc: i64) {
        let slot = match grade {
            Grade::A => &mut self.a,
            Grade::B => &mut self.b,
            Grade::C => &mut self.c,
            Grade::D => &mut self.d,
            Grade::E => &mut self.e,
            Grade::F => &mut self.f,
        };
        *slot += lloc;
    }
}

/// Halstead metrics, in the order the analyzer's YAML sorts them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Halstead {
    #[serde(rename = "N1")]
    pub n1: Metric,
    #[serde(rename = "N2")]
    pub n2: Metric,
    pub bugs: Metric,
    pub calculated_length: Metric,
    pub difficulty: Metric,
    pub effort: Metric,
    pub h1: Metric,
    pub h2: Metric,
    pub length: Metric,
    pub time: Metric,
    pub vocabulary: Metric,
    pub volume: Metric,
}

/// Raw line counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawStats {
    pub blank: i64,
    pub comments: i64,
    pub lloc: i64,
    pub loc: i64,
    pub multi: i64,
    pub single_comments: i64,
    pub sloc: i64,
}

/// The statistics of one source file, or the field-wise sum of many.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsRecord {
    pub complexity: Complexity,
    pub grades: Grades,
    pub halstead: Halstead,
    pub stats: RawStats,
}

fieldwise!(Complexity { class, func, total });
fieldwise!(Grades { a, b, c, d, e, f });
fieldwise!(Halstead {
    n1,
    n2,
    bugs,
    calculated_length,
    difficulty,
    effort,
    h1,
    h2,
    length,
    time,
    vocabulary,
    volume,
});
fieldwise!(RawStats {
    blank,
    comments,
    lloc,
    loc,
    multi,
    single_comments,
    sloc,
});
fieldwise!(StatsRecord {
    complexity,
    grades,
    halstead,
    stats,
});

/// Complexity grade assigned to a function or method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    E,
    F,
}

/// Grade and size of a single function or method.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodStat {
    pub name: String,
    pub grade: Grade,
    pub lloc: i64,
}

/// Everything the analyzer reports for one file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileAnalysis {
    pub record: StatsRecord,
    /// Sorted by name; empty when the analyzer does not report methods.
    pub methods: Vec<MethodStat>,
}

impl FileAnalysis {
    pub fn new(record: StatsRecord, mut methods: Vec<MethodStat>) -> Self {
        methods.sort_by(|a, b| a.name.cmp(&b.name));
        FileAnalysis { record, methods }
    }
}

/// A person plus the moment they acted, as recorded in a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub email: String,
    /// Seconds since the epoch.
    pub time: i64,
    /// Timezone offset in minutes.
    pub offset_minutes: i32,
}

/// A commit of the source repository.
#[derive(Debug, Clone)]
pub struct SourceCommit {
    pub id: git2::Oid,
    pub parents: Vec<git2::Oid>,
    pub author: Identity,
    pub committer: Identity,
    pub message: String,
}

/// How one tracked path changed in a replayed commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub insertions: u64,
    pub deletions: u64,
    pub lines: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renamed_from: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unanalyzable: bool,
    /// The record after this commit, if the file has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<StatsRecord>,
    /// After minus before; absent when there was no prior record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<StatsRecord>,
}

/// Sums over a group of change records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeTotals {
    pub files: u64,
    pub insertions: u64,
    pub deletions: u64,
    pub lines: u64,
    pub delta: StatsRecord,
}

impl ChangeTotals {
    /// Folds one change in. `effective_delta` counts a missing record as zero.
    pub fn record(&mut self, change: &ChangeRecord, effective_delta: StatsRecord) {
        self.files += 1;
        self.insertions += change.insertions;
        self.deletions += change.deletions;
        self.lines += change.lines;
        self.delta += effective_delta;
    }
}

/// Contents of `LATEST_CHANGES_TOTAL.yaml`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatestChangesTotal {
    #[serde(flatten)]
    pub total: ChangeTotals,
    pub test: ChangeTotals,
    pub non_test: ChangeTotals,
}
