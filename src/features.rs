//! Feature extractor: turns a region's geometry into the five-feature
//! vector the predictor consumes, per §4.C.

use crate::config::ModelLimits;
use crate::gateway::{InProcessGateway, SpatialGateway};
use crate::predictor::Features;
use crate::store::region::Region;

/// Buffer radius (meters) applied to a region's geometry before
/// intersecting with coastline segments, correcting for cartographic skew
/// between coastlines and administrative boundaries.
const COASTLINE_BUFFER_METERS: f64 = 100.0;

pub struct FeatureExtractor<'a> {
    gateway: &'a InProcessGateway,
    limits: &'a ModelLimits,
}

impl<'a> FeatureExtractor<'a> {
    pub fn new(gateway: &'a InProcessGateway, limits: &'a ModelLimits) -> Self {
        FeatureExtractor { gateway, limits }
    }

    /// Computes the feature vector for `region`, short-circuiting the
    /// remaining fields once land area alone is known to exceed the
    /// predictor's bound (§4.C step 2).
    pub fn extract(&self, region: &Region) -> Features {
        let bbox = match crate::geom::envelope(&region.geom) {
            Some(b) => b,
            None => return Features::default(),
        };

        let land_union = self.gateway.land_union_near(bbox);
        let land_intersection = self.gateway.intersection(&region.geom, &land_union);
        let land_area_km2 = self.gateway.area_geodesic(&land_intersection);

        if land_area_km2 > self.limits.land_area_km2 {
            return Features {
                land_area_km2: Some(land_area_km2),
                ..Features::default()
            };
        }

        let (city_count, city_population_sum, hamlet_count) =
            self.gateway.classify_places(&region.geom);

        let buffered = self.gateway.buffer(&region.geom, COASTLINE_BUFFER_METERS);
        let buffered_bbox = crate::geom::envelope(&buffered).unwrap_or(bbox);
        let coastlines = self.gateway.coastlines_near(buffered_bbox);
        // Clipping each coastline segment to the buffered region exactly
        // would need a line/polygon intersection `geo` does not expose in
        // this version; segments whose bbox falls inside the buffer are
        // counted in full, which is a minor overcount near the buffer edge.
        use geo::Contains;
        let relevant: Vec<_> = coastlines
            .0
            .iter()
            .filter(|line| line.0.iter().any(|c| buffered.contains(c)))
            .cloned()
            .collect();
        let coastline_length_km =
            self.gateway.length_geodesic(&geo::MultiLineString::new(relevant)) / 1000.0;

        Features {
            city_population_sum: Some(city_population_sum as f64),
            land_area_km2: Some(land_area_km2),
            city_count: Some(city_count as f64),
            hamlet_count: Some(hamlet_count as f64),
            coastline_length_km: Some(coastline_length_km),
        }
    }
}
