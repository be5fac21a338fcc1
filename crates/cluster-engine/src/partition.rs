use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::Error;

pub type Year = i32;
pub type DistrictId = i64;

/// The independent clustering scope: reporting year, source type and, for district scoped requests, a district.
///
/// Clusters from different partitions are never compared or merged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawPartitionKey")]
pub struct PartitionKey {
	year: Year,
	source_type: String,
	district_id: Option<DistrictId>,
}

/// Wire shape of a [`PartitionKey`], validated through [`resolve`] on the way in.
#[derive(Deserialize)]
struct RawPartitionKey {
	year: Year,
	source_type: String,
	#[serde(default)]
	district_id: Option<DistrictId>,
}

impl TryFrom<RawPartitionKey> for PartitionKey {
	type Error = Error;

	fn try_from(raw: RawPartitionKey) -> Result<Self, Self::Error> {
		resolve(Some(raw.year), Some(&raw.source_type), raw.district_id)
	}
}

impl PartitionKey {
	/// Builds a base (not district scoped) key, normalising the source type to lowercase.
	pub fn new(year: Year, source_type: impl AsRef<str>) -> Result<Self, Error> {
		resolve(Some(year), Some(source_type.as_ref()), None)
	}

	#[must_use]
	pub fn with_district(&self, district_id: DistrictId) -> Self {
		Self {
			district_id: Some(district_id),
			..self.clone()
		}
	}

	/// The same key without its district scope.
	#[must_use]
	pub fn base(&self) -> Self {
		Self {
			district_id: None,
			..self.clone()
		}
	}

	#[must_use]
	pub const fn year(&self) -> Year {
		self.year
	}

	#[must_use]
	pub fn source_type(&self) -> &str {
		&self.source_type
	}

	#[must_use]
	pub const fn district_id(&self) -> Option<DistrictId> {
		self.district_id
	}

	#[must_use]
	pub const fn is_district_scoped(&self) -> bool {
		self.district_id.is_some()
	}
}

impl fmt::Display for PartitionKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.year, self.source_type)?;
		if let Some(district_id) = self.district_id {
			write!(f, "/{district_id}")?;
		}
		Ok(())
	}
}

/// Anything a partition key can be derived from: incident records, recompute requests.
pub trait ResolvePartition {
	fn partition_key(&self) -> Result<PartitionKey, Error>;
}

/// Derives a partition key from possibly incomplete parts.
///
/// Pure function, the only failure is [`Error::InvalidPartition`] for a missing (or nonsensical) year or source type.
pub fn resolve(
	year: Option<Year>,
	source_type: Option<&str>,
	district_id: Option<DistrictId>,
) -> Result<PartitionKey, Error> {
	let year = year.ok_or_else(|| Error::InvalidPartition {
		reason: "missing year".to_string(),
	})?;

	if year <= 0 {
		return Err(Error::InvalidPartition {
			reason: format!("year must be positive, got {year}"),
		});
	}

	let source_type = source_type
		.map(str::trim)
		.filter(|source_type| !source_type.is_empty())
		.ok_or_else(|| Error::InvalidPartition {
			reason: "missing source type".to_string(),
		})?
		.to_lowercase();

	Ok(PartitionKey {
		year,
		source_type,
		district_id,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resolves_base_and_district_keys() {
		let base = resolve(Some(2024), Some("cbt"), None).expect("valid key");
		assert_eq!(base.year(), 2024);
		assert_eq!(base.source_type(), "cbt");
		assert!(!base.is_district_scoped());
		assert_eq!(base.to_string(), "2024/cbt");

		let scoped = resolve(Some(2024), Some("cbt"), Some(7)).expect("valid key");
		assert_eq!(scoped.to_string(), "2024/cbt/7");
		assert_eq!(scoped.base(), base);
		assert_eq!(base.with_district(7), scoped);
	}

	#[test]
	fn normalises_source_type() {
		assert_eq!(
			PartitionKey::new(2024, "  CBT ").expect("valid key"),
			PartitionKey::new(2024, "cbt").expect("valid key")
		);
	}

	#[test]
	fn rejects_missing_parts() {
		assert!(matches!(
			resolve(None, Some("cbt"), None),
			Err(Error::InvalidPartition { .. })
		));
		assert!(matches!(
			resolve(Some(2024), None, None),
			Err(Error::InvalidPartition { .. })
		));
		assert!(matches!(
			resolve(Some(2024), Some("   "), None),
			Err(Error::InvalidPartition { .. })
		));
		assert!(matches!(
			resolve(Some(0), Some("cbt"), None),
			Err(Error::InvalidPartition { .. })
		));
	}

	#[test]
	fn deserializing_validates_like_resolve() {
		let key = serde_json::from_str::<PartitionKey>(
			r#"{"year": 2024, "source_type": " CBT ", "district_id": 7}"#,
		)
		.expect("valid key");
		assert_eq!(key, resolve(Some(2024), Some("cbt"), Some(7)).expect("valid key"));

		let base = serde_json::from_str::<PartitionKey>(r#"{"year": 2024, "source_type": "cbt"}"#)
			.expect("valid key");
		assert!(!base.is_district_scoped());

		assert!(serde_json::from_str::<PartitionKey>(r#"{"year": 0, "source_type": "cbt"}"#).is_err());
		assert!(serde_json::from_str::<PartitionKey>(r#"{"year": 2024, "source_type": "  "}"#).is_err());

		let round_trip = serde_json::to_string(&key).expect("serializable");
		assert_eq!(
			serde_json::from_str::<PartitionKey>(&round_trip).expect("valid key"),
			key
		);
	}
}
