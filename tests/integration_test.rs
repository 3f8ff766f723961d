use geo::polygon;

use border_partitioner::bootstrap::{CountryBootstrap, CountryPlan};
use border_partitioner::config::ModelLimits;
use border_partitioner::error::Error;
use border_partitioner::features::FeatureExtractor;
use border_partitioner::gateway::InProcessGateway;
use border_partitioner::inputs::{InputData, LandPolygon, OsmBorder};
use border_partitioner::osm_xml::{self, XmlRegion};
use border_partitioner::predictor::{ModelAsset, Predictor, MODEL_SCHEMA_VERSION};
use border_partitioner::store::{BorderStore, InMemoryBorderStore};

fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> geo::MultiPolygon<f64> {
    geo::MultiPolygon::new(vec![polygon![
        (x: x0, y: y0), (x: x1, y: y0), (x: x1, y: y1), (x: x0, y: y1), (x: x0, y: y0),
    ]])
}

fn identity_predictor(limits: ModelLimits) -> Predictor {
    Predictor::new(
        ModelAsset {
            version: MODEL_SCHEMA_VERSION,
            intercept: 1.0,
            coefficients: [0.0, 0.0, 0.0, 0.0, 0.0],
            feature_means: [0.0; 5],
            feature_scales: [1.0; 5],
        },
        limits,
    )
}

// Scenario S6: country bootstrap with a single-level plan. When no
// level-4 polygons exist inside the country, it stands alone.
#[test]
fn scenario_s6_country_with_no_subregions_stands_alone() {
    let country = OsmBorder { osm_id: -1, name: "X".to_string(), admin_level: 2, geom: square(0.0, 0.0, 4.0, 4.0) };
    let gateway = InProcessGateway::new(InputData::new(vec![country], vec![], vec![], vec![], vec![]));
    let limits = ModelLimits::default();
    let predictor = identity_predictor(limits.clone());
    let store = InMemoryBorderStore::new(InProcessGateway::new(InputData::empty()), false, std::env::temp_dir());

    let bootstrap = CountryBootstrap::new(&store, &gateway, &predictor, &limits);
    let plan = CountryPlan { name: "X".to_string(), levels: vec![4] };
    let country_id = bootstrap.bootstrap_country(&plan, 1000.0, false).unwrap();

    let region = store.get(country_id).unwrap();
    assert_eq!(region.name, "X");
    assert_eq!(store.children(country_id).unwrap().len(), 0);
}

// Scenario S7 / T6: OSM-XML round-trip through serialize then parse
// preserves region names, disabled flags, and geometric shape.
#[test]
fn scenario_s7_and_t6_xml_round_trip_preserves_shape_and_metadata() {
    let regions = vec![
        XmlRegion { id: 1, name: "Alpha".to_string(), disabled: false, geom: square(0.0, 0.0, 1.0, 1.0) },
        XmlRegion { id: 2, name: "Beta".to_string(), disabled: true, geom: square(2.0, 0.0, 3.0, 1.0) },
    ];
    let xml = osm_xml::serialize_borders(&regions, false).unwrap();
    let parsed = osm_xml::parse_borders(&xml).unwrap();

    assert_eq!(parsed.len(), 2);
    let alpha = parsed.iter().find(|r| r.name.as_deref() == Some("Alpha")).unwrap();
    assert!(!alpha.disabled);
    assert_eq!(alpha.geom.0[0].exterior().0.len(), regions[0].geom.0[0].exterior().0.len());

    let beta = parsed.iter().find(|r| r.name.as_deref() == Some("Beta")).unwrap();
    assert!(beta.disabled);
}

// Scenario S8: a subregion whose land area exceeds the configured bound
// yields no prediction, so the partitioning engine aborts with Unestimable.
#[test]
fn scenario_s8_partitioning_aborts_when_predictor_is_unavailable() {
    let mut limits = ModelLimits::default();
    limits.land_area_km2 = 1.0;
    let predictor = identity_predictor(limits.clone());

    let huge = OsmBorder { osm_id: 1, name: "Huge".to_string(), admin_level: 4, geom: square(1.0, 1.0, 49.0, 49.0) };
    let land = LandPolygon { geom: square(0.0, 0.0, 50.0, 50.0) };
    let gateway = InProcessGateway::new(InputData::new(vec![huge.clone()], vec![], vec![land], vec![], vec![]));

    let parent = border_partitioner::store::region::Region::new(0, "Parent", square(0.0, 0.0, 50.0, 50.0), None);
    let border_region = border_partitioner::store::region::Region::new(
        huge.osm_id,
        huge.name.clone(),
        huge.geom.clone(),
        Some(parent.id),
    );
    let extractor = FeatureExtractor::new(&gateway, &limits);
    let features = extractor.extract(&border_region);
    assert!(predictor.predict(&features).is_none());

    let engine = border_partitioner::partition::PartitioningEngine::new(&gateway, &predictor, &limits);
    let err = engine.collect_subregions(&parent, 4).unwrap_err();
    assert!(matches!(err, Error::Unestimable(1)));
}
