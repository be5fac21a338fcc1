//! Coordinates and the distance metrics used to compare incidents with centroids.

use serde::{Deserialize, Serialize};

/// Mean earth radius (IUGG) in metres.
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// A WGS84 point, latitude and longitude in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
	pub latitude: f64,
	pub longitude: f64,
}

impl Coordinate {
	#[must_use]
	pub const fn new(latitude: f64, longitude: f64) -> Self {
		Self {
			latitude,
			longitude,
		}
	}

	/// Finite and inside the WGS84 ranges.
	#[must_use]
	pub fn is_valid(&self) -> bool {
		self.latitude.is_finite()
			&& self.longitude.is_finite()
			&& (-90.0..=90.0).contains(&self.latitude)
			&& (-180.0..=180.0).contains(&self.longitude)
	}
}

/// How distances between incidents and centroids are measured.
///
/// The unit of a distance, and so of `assignment_radius` and `radius_estimate`, depends on the metric:
/// metres for [`DistanceMetric::Haversine`], plain degrees for [`DistanceMetric::Euclidean`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
	#[default]
	Haversine,
	Euclidean,
}

impl DistanceMetric {
	#[must_use]
	pub fn distance(self, a: Coordinate, b: Coordinate) -> f64 {
		match self {
			Self::Haversine => haversine(a, b),
			Self::Euclidean => euclidean(a, b),
		}
	}

	#[must_use]
	pub fn squared_distance(self, a: Coordinate, b: Coordinate) -> f64 {
		match self {
			Self::Haversine => {
				let d = haversine(a, b);
				d * d
			}
			// Skipping the sqrt, only the argmin matters on the hot path
			Self::Euclidean => squared_euclidean(a, b),
		}
	}

	#[must_use]
	pub const fn unit(self) -> &'static str {
		match self {
			Self::Haversine => "m",
			Self::Euclidean => "deg",
		}
	}
}

/// Great-circle distance in metres.
#[must_use]
pub fn haversine(a: Coordinate, b: Coordinate) -> f64 {
	let (lat_a, lat_b) = (a.latitude.to_radians(), b.latitude.to_radians());
	let d_lat = lat_b - lat_a;
	let d_lon = (b.longitude - a.longitude).to_radians();

	let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);

	2.0 * EARTH_RADIUS_METERS * h.sqrt().min(1.0).asin()
}

#[must_use]
pub fn euclidean(a: Coordinate, b: Coordinate) -> f64 {
	squared_euclidean(a, b).sqrt()
}

#[inline]
fn squared_euclidean(a: Coordinate, b: Coordinate) -> f64 {
	let d_lat = a.latitude - b.latitude;
	let d_lon = a.longitude - b.longitude;
	d_lat.mul_add(d_lat, d_lon * d_lon)
}

/// Arithmetic mean of the given coordinates, `None` for an empty input.
#[allow(clippy::cast_precision_loss)]
pub fn mean(points: impl IntoIterator<Item = Coordinate>) -> Option<Coordinate> {
	let (count, lat_sum, lon_sum) = points
		.into_iter()
		.fold((0usize, 0.0, 0.0), |(count, lat, lon), point| {
			(count + 1, lat + point.latitude, lon + point.longitude)
		});

	(count > 0).then(|| Coordinate::new(lat_sum / count as f64, lon_sum / count as f64))
}
