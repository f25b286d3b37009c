//! SolarNetwork domain enumerations.
//!
//! These mirror the names understood by the SolarNetwork API, and double as
//! the read-only catalogue of choices offered by the query editor.

use std::{fmt, str::FromStr};

use serde::Serialize;

use crate::Error;

macro_rules! named_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $unknown:ident {
            $($(#[$vmeta:meta])* $variant:ident),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Every variant, in API order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// The name used by the SolarNetwork API.
            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => stringify!($variant)),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            /// Parse an API name, ignoring ASCII case.
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::ALL
                    .iter()
                    .copied()
                    .find(|v| v.name().eq_ignore_ascii_case(s))
                    .ok_or_else(|| Error::$unknown(s.to_string()))
            }
        }
    };
}

named_enum! {
    /// A server-side time bucketing level.
    Aggregation, UnknownAggregation {
        /// One minute buckets.
        Minute,
        /// Five minute buckets.
        FiveMinute,
        /// Ten minute buckets.
        TenMinute,
        /// Fifteen minute buckets.
        FifteenMinute,
        /// Thirty minute buckets.
        ThirtyMinute,
        /// One hour buckets.
        Hour,
        /// Averages per hour of the day.
        HourOfDay,
        /// Averages per hour of the day, per season.
        SeasonalHourOfDay,
        /// One day buckets.
        Day,
        /// Averages per day of the week.
        DayOfWeek,
        /// Averages per day of the week, per season.
        SeasonalDayOfWeek,
        /// One week buckets.
        Week,
        /// Averages per week of the year.
        WeekOfYear,
        /// One month buckets.
        Month,
        /// One year buckets.
        Year,
        /// A single bucket accumulated over all time.
        RunningTotal,
    }
}

named_enum! {
    /// How several nodes or sources are merged into one virtual series.
    CombiningType, UnknownCombiningType {
        /// The average of the combined values.
        Average,
        /// The sum of the combined values.
        Sum,
        /// The difference between the combined values.
        Difference,
    }
}

named_enum! {
    /// The kind of derived value a datum reading query returns.
    DatumReadingType, UnknownReadingType {
        /// Values interpolated at a point in time.
        CalculatedAt,
        /// The difference between values interpolated at the range ends.
        CalculatedAtDifference,
        /// The difference between the datum nearest the range ends.
        NearestDifference,
        /// The difference between the datum within or before the range ends.
        Difference,
        /// The difference between the datum strictly within the range.
        DifferenceWithin,
    }
}

impl Default for DatumReadingType {
    fn default() -> Self {
        Self::Difference
    }
}

/// Names of every aggregation.
pub fn aggregation_names() -> Vec<&'static str> {
    Aggregation::ALL.iter().map(|a| a.name()).collect()
}

/// Names of every combining type.
pub fn combining_type_names() -> Vec<&'static str> {
    CombiningType::ALL.iter().map(|c| c.name()).collect()
}

/// Names of every datum reading type.
pub fn reading_type_names() -> Vec<&'static str> {
    DatumReadingType::ALL.iter().map(|r| r.name()).collect()
}

/// The full name catalogue, as served to the query editor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NameCatalogue {
    /// See [`aggregation_names`].
    pub aggregations: Vec<&'static str>,
    /// See [`combining_type_names`].
    pub combining_types: Vec<&'static str>,
    /// See [`reading_type_names`].
    pub reading_types: Vec<&'static str>,
}

impl Default for NameCatalogue {
    fn default() -> Self {
        Self {
            aggregations: aggregation_names(),
            combining_types: combining_type_names(),
            reading_types: reading_type_names(),
        }
    }
}
