/// Mean Earth radius used by the spherical approximation.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance in kilometres between two `(lat, lon)` points.
pub fn haversine_km(from: (f64, f64), to: (f64, f64)) -> f64 {
    let (lat1, lon1) = (from.0.to_radians(), from.1.to_radians());
    let (lat2, lon2) = (to.0.to_radians(), to.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// Nearest item by great-circle distance, with that distance.
pub fn nearest<'a, T>(
    origin: (f64, f64),
    items: impl IntoIterator<Item = &'a T>,
    position: impl Fn(&T) -> (f64, f64),
) -> Option<(&'a T, f64)>
where
    T: 'a,
{
    items
        .into_iter()
        .map(|item| (item, haversine_km(origin, position(item))))
        .min_by(|a, b| a.1.total_cmp(&b.1))
}
