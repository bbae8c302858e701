//! Index descriptor grammar and distance metrics
//!
//! A descriptor is a comma-separated, case-sensitive composition of
//! components: `Flat` (no suffix), `HNSW{n}`, `IVF{n}`, `PQ{n}` where `n`
//! is a power of two in `[2, 256]`. Whitespace around components is trimmed.
//!
//! The descriptor determines whether the index must be trained before it
//! accepts vectors, and how many training samples that requires.

use crate::defaults::PQ_MIN_TRAIN;
use crate::error::{DbError, Result};

/// One component of a composite index descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Flat,
    Hnsw(u32),
    Ivf(u32),
    Pq(u32),
}

/// Parsed and validated index descriptor
#[derive(Debug, Clone)]
pub struct Descriptor {
    raw: String,
    components: Vec<Component>,
}

impl Descriptor {
    /// Parse a descriptor string, validating the grammar
    pub fn parse(raw: &str) -> Result<Self> {
        let mut components = Vec::new();

        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(DbError::validation(format!(
                    "index type '{raw}' is not allowed"
                )));
            }
            components.push(parse_component(part, raw)?);
        }

        Ok(Self {
            raw: raw.to_string(),
            components,
        })
    }

    /// The descriptor string as given
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// Minimum training samples before the index accepts adds.
    ///
    /// `Flat` and `HNSW*` need none; `IVF{n}` needs at least `n`; any `PQ`
    /// component needs at least 256. Composites take the maximum.
    pub fn training_threshold(&self) -> usize {
        self.components
            .iter()
            .map(|c| match c {
                Component::Flat | Component::Hnsw(_) => 0,
                Component::Ivf(n) => *n as usize,
                Component::Pq(_) => PQ_MIN_TRAIN,
            })
            .max()
            .unwrap_or(0)
    }

    /// The inverted-list count when an IVF component is present
    pub fn ivf_nlist(&self) -> Option<u32> {
        self.components.iter().find_map(|c| match c {
            Component::Ivf(n) => Some(*n),
            _ => None,
        })
    }
}

fn parse_component(part: &str, raw: &str) -> Result<Component> {
    let invalid = || DbError::validation(format!("index type '{raw}' is not allowed"));

    let digits_at = part.find(|c: char| c.is_ascii_digit());
    let (base, suffix) = match digits_at {
        Some(i) => {
            let n: u32 = part[i..].parse().map_err(|_| invalid())?;
            (&part[..i], Some(n))
        }
        None => (part, None),
    };

    match (base, suffix) {
        ("Flat", None) => Ok(Component::Flat),
        ("HNSW", Some(n)) if is_power_of_two_in_range(n) => Ok(Component::Hnsw(n)),
        ("IVF", Some(n)) if is_power_of_two_in_range(n) => Ok(Component::Ivf(n)),
        ("PQ", Some(n)) if is_power_of_two_in_range(n) => Ok(Component::Pq(n)),
        _ => Err(invalid()),
    }
}

fn is_power_of_two_in_range(n: u32) -> bool {
    (2..=256).contains(&n) && n.is_power_of_two()
}

/// Distance metric tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    L2,
    InnerProduct,
    L1,
    Lp,
    Canberra,
    BrayCurtis,
    JensenShannon,
    Linf,
}

impl Metric {
    /// Parse one of the allowed metric tags
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "L2" => Ok(Self::L2),
            "InnerProduct" => Ok(Self::InnerProduct),
            "L1" => Ok(Self::L1),
            "Lp" => Ok(Self::Lp),
            "Canberra" => Ok(Self::Canberra),
            "BrayCurtis" => Ok(Self::BrayCurtis),
            "JensenShannon" => Ok(Self::JensenShannon),
            "Linf" => Ok(Self::Linf),
            _ => Err(DbError::validation(format!(
                "metric '{raw}' is not allowed"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::L2 => "L2",
            Self::InnerProduct => "InnerProduct",
            Self::L1 => "L1",
            Self::Lp => "Lp",
            Self::Canberra => "Canberra",
            Self::BrayCurtis => "BrayCurtis",
            Self::JensenShannon => "JensenShannon",
            Self::Linf => "Linf",
        }
    }

    /// Stable one-byte code for the on-disk index header
    pub fn code(&self) -> u8 {
        match self {
            Self::L2 => 0,
            Self::InnerProduct => 1,
            Self::L1 => 2,
            Self::Lp => 3,
            Self::Canberra => 4,
            Self::BrayCurtis => 5,
            Self::JensenShannon => 6,
            Self::Linf => 7,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::L2),
            1 => Ok(Self::InnerProduct),
            2 => Ok(Self::L1),
            3 => Ok(Self::Lp),
            4 => Ok(Self::Canberra),
            5 => Ok(Self::BrayCurtis),
            6 => Ok(Self::JensenShannon),
            7 => Ok(Self::Linf),
            other => Err(DbError::invariant(format!(
                "unknown metric code {other} in index file"
            ))),
        }
    }

    /// Distance between two vectors; smaller is always closer.
    ///
    /// Inner product is negated so one ordering convention covers every
    /// metric.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::L2 => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum(),
            Self::InnerProduct => -a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>(),
            Self::L1 => a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum(),
            Self::Lp => {
                let sum: f32 = a.iter().zip(b).map(|(x, y)| (x - y).abs().powi(3)).sum();
                sum.powf(1.0 / 3.0)
            }
            Self::Canberra => a
                .iter()
                .zip(b)
                .map(|(x, y)| {
                    let denom = x.abs() + y.abs();
                    if denom > 0.0 {
                        (x - y).abs() / denom
                    } else {
                        0.0
                    }
                })
                .sum(),
            Self::BrayCurtis => {
                let num: f32 = a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum();
                let denom: f32 = a.iter().zip(b).map(|(x, y)| (x + y).abs()).sum();
                if denom > 0.0 {
                    num / denom
                } else {
                    0.0
                }
            }
            Self::JensenShannon => {
                let mut sum = 0.0f32;
                for (&x, &y) in a.iter().zip(b) {
                    let x = x.max(0.0);
                    let y = y.max(0.0);
                    let m = 0.5 * (x + y);
                    if m > 0.0 {
                        if x > 0.0 {
                            sum += 0.5 * x * (x / m).ln();
                        }
                        if y > 0.0 {
                            sum += 0.5 * y * (y / m).ln();
                        }
                    }
                }
                sum
            }
            Self::Linf => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y).abs())
                .fold(0.0, f32::max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_components() {
        assert!(Descriptor::parse("Flat").is_ok());
        assert!(Descriptor::parse("HNSW32").is_ok());
        assert!(Descriptor::parse("IVF256").is_ok());
        assert!(Descriptor::parse("PQ8").is_ok());
    }

    #[test]
    fn test_parse_composites() {
        let d = Descriptor::parse("IVF32,Flat").unwrap();
        assert_eq!(
            d.components(),
            &[Component::Ivf(32), Component::Flat]
        );

        // Whitespace around components is trimmed
        let d = Descriptor::parse("IVF64, PQ8").unwrap();
        assert_eq!(d.components(), &[Component::Ivf(64), Component::Pq(8)]);
    }

    #[test]
    fn test_parse_rejections() {
        // Flat takes no suffix
        assert!(Descriptor::parse("Flat8").is_err());
        // Suffix required for the others
        assert!(Descriptor::parse("IVF").is_err());
        assert!(Descriptor::parse("HNSW").is_err());
        // Power of two in [2, 256]
        assert!(Descriptor::parse("IVF3").is_err());
        assert!(Descriptor::parse("IVF512").is_err());
        assert!(Descriptor::parse("PQ1").is_err());
        // Unknown base and empty component
        assert!(Descriptor::parse("LSH16").is_err());
        assert!(Descriptor::parse("IVF32,,Flat").is_err());
        // Case sensitive
        assert!(Descriptor::parse("flat").is_err());
    }

    #[test]
    fn test_training_thresholds() {
        assert_eq!(Descriptor::parse("Flat").unwrap().training_threshold(), 0);
        assert_eq!(Descriptor::parse("HNSW32").unwrap().training_threshold(), 0);
        assert_eq!(Descriptor::parse("IVF32,Flat").unwrap().training_threshold(), 32);
        assert_eq!(Descriptor::parse("PQ8").unwrap().training_threshold(), 256);
        // Composite takes the maximum of the components
        assert_eq!(
            Descriptor::parse("IVF32,PQ8").unwrap().training_threshold(),
            256
        );
    }

    #[test]
    fn test_metric_parse() {
        for tag in [
            "L2",
            "InnerProduct",
            "L1",
            "Lp",
            "Canberra",
            "BrayCurtis",
            "JensenShannon",
            "Linf",
        ] {
            let metric = Metric::parse(tag).unwrap();
            assert_eq!(metric.as_str(), tag);
            assert_eq!(Metric::from_code(metric.code()).unwrap(), metric);
        }
        assert!(Metric::parse("Cosine").is_err());
    }

    #[test]
    fn test_l2_distance() {
        let d = Metric::L2.distance(&[0.0, 0.0], &[3.0, 4.0]);
        assert!((d - 25.0).abs() < 1e-6);
    }

    #[test]
    fn test_inner_product_orders_most_similar_first() {
        let query = [1.0, 0.0];
        let near = [2.0, 0.0];
        let far = [0.1, 0.0];
        assert!(Metric::InnerProduct.distance(&query, &near) < Metric::InnerProduct.distance(&query, &far));
    }

    #[test]
    fn test_linf_distance() {
        let d = Metric::Linf.distance(&[1.0, 5.0], &[2.0, 1.0]);
        assert!((d - 4.0).abs() < 1e-6);
    }
}
