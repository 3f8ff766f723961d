//! OSM-XML codec: serializes borders to, and parses borders from, OSM 0.6
//! XML with nodes/ways/multipolygon relations, per §4.H. Grounded directly
//! on `osm_xml.py`'s `borders_to_xml`/`borders_from_xml`, including its
//! ring-hash deduplication and fragmented-way reassembly algorithm.

use std::collections::{hash_map::DefaultHasher, HashMap};
use std::hash::{Hash, Hasher};
use std::io::Cursor;

use geo::{Coord, LineString, MultiPolygon, Polygon};
use quick_xml::escape::escape;
use quick_xml::events::{BytesDecl, BytesStart, Event};
use quick_xml::{Reader, Writer};

use crate::error::{Error, Result};

/// The minimal view of a region this codec needs, decoupled from the full
/// `Region` store row so the codec has no dependency on the store.
#[derive(Debug, Clone)]
pub struct XmlRegion {
    pub id: i64,
    pub name: String,
    pub disabled: bool,
    pub geom: MultiPolygon<f64>,
}

#[derive(Debug, Clone)]
pub struct ParsedRegion {
    pub id: i64,
    pub name: Option<String>,
    pub disabled: bool,
    pub modified: bool,
    pub geom: MultiPolygon<f64>,
}

type NodeId = u64;

/// Coordinate-keyed node pool, ids starting at 1, mirroring `node_pool` in
/// the source codec.
struct NodePool {
    ids: HashMap<(i64, i64), NodeId>,
    next: NodeId,
}

/// Coordinates are bucketed to this many decimal places before being used
/// as a dedup key, matching "one <node> per distinct coordinate."
const COORD_SCALE: f64 = 1e7;

impl NodePool {
    fn new() -> NodePool {
        NodePool { ids: HashMap::new(), next: 1 }
    }

    fn id_for(&mut self, lon: f64, lat: f64) -> NodeId {
        let key = ((lon * COORD_SCALE).round() as i64, (lat * COORD_SCALE).round() as i64);
        if let Some(id) = self.ids.get(&key) {
            return *id;
        }
        let id = self.next;
        self.ids.insert(key, id);
        self.next += 1;
        id
    }

    fn coords(&self) -> Vec<(NodeId, f64, f64)> {
        self.ids
            .iter()
            .map(|(&(lon, lat), &id)| (id, lon as f64 / COORD_SCALE, lat as f64 / COORD_SCALE))
            .collect()
    }
}

fn ring_hash(refs: &[NodeId]) -> u64 {
    let mut sorted = refs.to_vec();
    sorted.sort_unstable();
    let mut hasher = DefaultHasher::new();
    sorted.hash(&mut hasher);
    hasher.finish()
}

fn ring_to_ids(pool: &mut NodePool, ring: &LineString<f64>) -> Vec<NodeId> {
    ring.0.iter().map(|c| pool.id_for(c.x, c.y)).collect()
}

/// **Serialize.** See §4.H. A configuration flag (`josm_force_multi`) may
/// force every border into multipolygon form even when a single outer ring
/// would otherwise suffice.
pub fn serialize_borders(regions: &[XmlRegion], josm_force_multi: bool) -> Result<String> {
    let mut pool = NodePool::new();

    let mut prepared = Vec::with_capacity(regions.len());
    for region in regions {
        let mut rings = Vec::new();
        for polygon in &region.geom.0 {
            rings.push(("outer", ring_to_ids(&mut pool, polygon.exterior())));
            for interior in polygon.interiors() {
                rings.push(("inner", ring_to_ids(&mut pool, interior)));
            }
        }
        if !rings.is_empty() {
            prepared.push(PreparedRegion { id: region.id.abs(), name: region.name.clone(), disabled: region.disabled, rings });
        }
    }

    build_xml(&prepared, &mut pool, josm_force_multi)
}

struct PreparedRegion {
    id: i64,
    name: String,
    disabled: bool,
    rings: Vec<(&'static str, Vec<NodeId>)>,
}

fn build_xml(prepared: &[PreparedRegion], pool: &mut NodePool, josm_force_multi: bool) -> Result<String> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut osm_start = BytesStart::new("osm");
    osm_start.push_attribute(("version", "0.6"));
    osm_start.push_attribute(("upload", "false"));
    writer.write_event(Event::Start(osm_start))?;

    let mut ways: HashMap<u64, i64> = HashMap::new();
    let mut used_way_ids: std::collections::HashSet<i64> = std::collections::HashSet::new();
    let mut way_counter: i64 = 0;
    let mut way_bodies: Vec<(i64, Vec<NodeId>, Option<(&str, bool)>)> = Vec::new();
    let mut relation_bodies: Vec<(i64, String, bool, Vec<(&'static str, i64)>)> = Vec::new();

    for region in prepared {
        let first_key = ring_hash(&region.rings[0].1);
        let simple = !josm_force_multi && region.rings.len() == 1 && !ways.contains_key(&first_key);
        if simple {
            ways.insert(first_key, region.id);
            used_way_ids.insert(region.id);
            way_bodies.push((region.id, region.rings[0].1.clone(), Some((region.name.as_str(), region.disabled))));
        } else {
            let mut members = Vec::new();
            for (role, refs) in &region.rings {
                let key = ring_hash(refs);
                let way_id = if let Some(existing) = ways.get(&key) {
                    *existing
                } else {
                    way_counter += 1;
                    while used_way_ids.contains(&way_counter) {
                        way_counter += 1;
                    }
                    let new_id = way_counter;
                    used_way_ids.insert(new_id);
                    ways.insert(key, new_id);
                    way_bodies.push((new_id, refs.clone(), None));
                    new_id
                };
                members.push((*role, way_id));
            }
            relation_bodies.push((region.id, region.name.clone(), region.disabled, members));
        }
    }

    for (id, refs, tags) in &way_bodies {
        let mut way_start = BytesStart::new("way");
        way_start.push_attribute(("id", id.to_string().as_str()));
        way_start.push_attribute(("visible", "true"));
        way_start.push_attribute(("version", "1"));
        writer.write_event(Event::Start(way_start))?;
        if let Some((name, disabled)) = tags {
            write_tag(&mut writer, "name", name)?;
            if *disabled {
                write_tag(&mut writer, "disabled", "yes")?;
            }
        }
        for nd in refs {
            let mut nd_start = BytesStart::new("nd");
            nd_start.push_attribute(("ref", nd.to_string().as_str()));
            writer.write_event(Event::Empty(nd_start))?;
        }
        writer.write_event(Event::End(quick_xml::events::BytesEnd::new("way")))?;
    }

    // nodes: emitted after way bodies are computed so the pool is complete,
    // but must appear before ways in valid OSM-XML; buffer and prepend.
    let mut node_writer = Writer::new(Cursor::new(Vec::new()));
    let mut coords = pool.coords();
    coords.sort_by_key(|&(id, _, _)| id);
    for (id, lon, lat) in coords {
        let mut node_start = BytesStart::new("node");
        node_start.push_attribute(("id", id.to_string().as_str()));
        node_start.push_attribute(("visible", "true"));
        node_start.push_attribute(("version", "1"));
        node_start.push_attribute(("lat", lat.to_string().as_str()));
        node_start.push_attribute(("lon", lon.to_string().as_str()));
        node_writer.write_event(Event::Empty(node_start))?;
    }

    for (id, name, disabled, members) in &relation_bodies {
        let mut rel_start = BytesStart::new("relation");
        rel_start.push_attribute(("id", id.to_string().as_str()));
        rel_start.push_attribute(("visible", "true"));
        rel_start.push_attribute(("version", "1"));
        writer.write_event(Event::Start(rel_start))?;
        write_tag(&mut writer, "type", "multipolygon")?;
        write_tag(&mut writer, "name", name)?;
        if *disabled {
            write_tag(&mut writer, "disabled", "yes")?;
        }
        for (role, way_id) in members {
            let mut member_start = BytesStart::new("member");
            member_start.push_attribute(("type", "way"));
            member_start.push_attribute(("ref", way_id.to_string().as_str()));
            member_start.push_attribute(("role", *role));
            writer.write_event(Event::Empty(member_start))?;
        }
        writer.write_event(Event::End(quick_xml::events::BytesEnd::new("relation")))?;
    }

    writer.write_event(Event::End(quick_xml::events::BytesEnd::new("osm")))?;

    let body = String::from_utf8(writer.into_inner().into_inner()).unwrap();
    let nodes = String::from_utf8(node_writer.into_inner().into_inner()).unwrap();
    // splice nodes in right after the <osm ...> open tag.
    let split_at = body.find("upload=\"false\">").map(|i| i + "upload=\"false\">".len()).unwrap();
    Ok(format!("{}{}{}", &body[..split_at], nodes, &body[split_at..]))
}

fn write_tag(writer: &mut Writer<Cursor<Vec<u8>>>, key: &str, value: &str) -> Result<()> {
    let mut tag = BytesStart::new("tag");
    tag.push_attribute(("k", key));
    tag.push_attribute(("v", escape(value).as_ref()));
    writer.write_event(Event::Empty(tag))?;
    Ok(())
}

#[derive(Debug, Clone, Default)]
struct WayRecord {
    name: Option<String>,
    disabled: bool,
    modified: bool,
    nodes: Vec<String>,
    used: bool,
}

#[derive(Debug, Clone, Default)]
struct NodeRecord {
    lat: f64,
    lon: f64,
    modified: bool,
}

/// Joins two node-id chains sharing an endpoint, reversing as needed;
/// returns `None` if either is already closed or they do not share an
/// endpoint, mirroring `_append_way`.
fn append_way(way: &[String], other: &[String]) -> Option<Vec<String>> {
    if way.first() == way.last() || other.first() == other.last() {
        return None;
    }
    let mut other = other.to_vec();
    if way.first() == other.first() || way.last() == other.last() {
        other.reverse();
    }
    if way.last() == other.first() {
        let mut result = way.to_vec();
        result.extend(other.into_iter().skip(1));
        Some(result)
    } else if way.first() == other.last() {
        let mut result = other;
        result.extend(way.iter().cloned());
        Some(result)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy)]
struct Bbox {
    min_lon: f64,
    min_lat: f64,
    max_lon: f64,
    max_lat: f64,
}

impl Bbox {
    fn empty() -> Bbox {
        Bbox { min_lon: 1e4, min_lat: 1e4, max_lon: -1e4, max_lat: -1e4 }
    }

    fn extend_point(&mut self, lon: f64, lat: f64) {
        self.min_lon = self.min_lon.min(lon);
        self.min_lat = self.min_lat.min(lat);
        self.max_lon = self.max_lon.max(lon);
        self.max_lat = self.max_lat.max(lat);
    }

    fn extend_bbox(&mut self, other: Bbox) {
        self.min_lon = self.min_lon.min(other.min_lon);
        self.min_lat = self.min_lat.min(other.min_lat);
        self.max_lon = self.max_lon.max(other.max_lon);
        self.max_lat = self.max_lat.max(other.max_lat);
    }

    fn contains(&self, inner: Bbox) -> bool {
        self.min_lon <= inner.min_lon
            && self.min_lat <= inner.min_lat
            && self.max_lon >= inner.max_lon
            && self.max_lat >= inner.max_lat
    }
}

struct WayWithBbox {
    nodes: Vec<String>,
    bbox: Bbox,
    modified: bool,
}

/// **Parse.** See §4.H. Reassembles fragmented multipolygon ways and
/// rejects malformed input with the error kinds named there.
pub fn parse_borders(xml: &str) -> Result<Vec<ParsedRegion>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut nodes: HashMap<String, NodeRecord> = HashMap::new();
    let mut ways: HashMap<String, WayRecord> = HashMap::new();

    let mut buf = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut current_way_id: Option<String> = None;
    let mut current_rel: Option<(String, Option<String>, Vec<(String, String)>, Vec<(String, String)>)> = None;
    // (id, action) tags: Vec<(key, value)> members: Vec<(role, ref)>

    loop {
        match reader.read_event_into(&mut buf).map_err(Error::Xml)? {
            Event::Eof => break,
            Event::Start(e) | Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                let mut attrs: HashMap<String, String> = HashMap::new();
                for attr in e.attributes().flatten() {
                    let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                    let value = attr.unescape_value().unwrap_or_default().to_string();
                    attrs.insert(key, value);
                }
                match name.as_str() {
                    "node" => {
                        if attrs.get("action").map(String::as_str) == Some("delete") {
                            continue;
                        }
                        let id = attrs.get("id").cloned().unwrap_or_default();
                        let id_num: i64 = id.parse().unwrap_or(0);
                        let modified = id_num < 0 || attrs.get("action").map(String::as_str) == Some("modify");
                        let lat: f64 = attrs.get("lat").and_then(|v| v.parse().ok()).unwrap_or(0.0);
                        let lon: f64 = attrs.get("lon").and_then(|v| v.parse().ok()).unwrap_or(0.0);
                        nodes.insert(id, NodeRecord { lat, lon, modified });
                    }
                    "way" => {
                        if attrs.get("action").map(String::as_str) == Some("delete") {
                            current_way_id = None;
                            continue;
                        }
                        let id = attrs.get("id").cloned().unwrap_or_default();
                        let id_num: i64 = id.parse().unwrap_or(0);
                        let modified = id_num < 0 || attrs.get("action").map(String::as_str) == Some("modify");
                        current_way_id = Some(id.clone());
                        ways.insert(id, WayRecord { modified, ..WayRecord::default() });
                    }
                    "nd" => {
                        if let Some(way_id) = &current_way_id {
                            if let Some(ref_) = attrs.get("ref") {
                                if !nodes.contains_key(ref_) {
                                    return Err(Error::MissingReference(format!("node {ref_} in way {way_id}")));
                                }
                                ways.get_mut(way_id).unwrap().nodes.push(ref_.clone());
                            }
                        }
                    }
                    "tag" => {
                        let k = attrs.get("k").cloned().unwrap_or_default();
                        let v = attrs.get("v").cloned().unwrap_or_default();
                        if let Some(way_id) = &current_way_id {
                            if stack.last().map(String::as_str) == Some("way") {
                                let record = ways.get_mut(way_id).unwrap();
                                if k == "name" {
                                    record.name = Some(v);
                                } else if k == "disabled" && v == "yes" {
                                    record.disabled = true;
                                }
                                continue;
                            }
                        }
                        if let Some((_, _, tags, _)) = current_rel.as_mut() {
                            tags.push((k, v));
                        }
                    }
                    "relation" => {
                        if attrs.get("action").map(String::as_str) == Some("delete") {
                            current_rel = None;
                        } else {
                            let id = attrs.get("id").cloned().unwrap_or_default();
                            current_rel = Some((id, attrs.get("action").cloned(), Vec::new(), Vec::new()));
                        }
                    }
                    "member" => {
                        if let Some((rel_id, _, _, members)) = current_rel.as_mut() {
                            let ref_ = attrs.get("ref").cloned().unwrap_or_default();
                            if !ways.contains_key(&ref_) {
                                return Err(Error::MissingReference(format!("way {ref_} in relation {rel_id}")));
                            }
                            let role = attrs.get("role").cloned().unwrap_or_default();
                            if role != "outer" && role != "inner" {
                                return Err(Error::MalformedXML(format!(
                                    "unknown role {role} in relation {rel_id}"
                                )));
                            }
                            ways.get_mut(&ref_).unwrap().used = true;
                            members.push((role, ref_));
                        }
                    }
                    _ => {}
                }
                stack.push(name);
            }
            Event::End(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if name == "way" {
                    current_way_id = None;
                }
                if stack.last().map(String::as_str) == Some(name.as_str()) {
                    stack.pop();
                }
            }
            _ => {}
        }
        buf.clear();
    }

    // Compute way modification and bbox, reject <2-node ways, per the
    // source codec's way-reading pass.
    let mut way_info: HashMap<String, WayWithBbox> = HashMap::new();
    for (id, record) in &ways {
        if record.nodes.len() < 2 {
            return Err(Error::MalformedXML(format!("way {id} has fewer than 2 nodes")));
        }
        let mut bbox = Bbox::empty();
        let mut modified = record.modified;
        for nd in &record.nodes {
            let node = nodes.get(nd).ok_or_else(|| Error::MissingReference(format!("node {nd} in way {id}")))?;
            bbox.extend_point(node.lon, node.lat);
            if node.modified {
                modified = true;
            }
        }
        way_info.insert(id.clone(), WayWithBbox { nodes: record.nodes.clone(), bbox, modified });
    }

    // Re-walk to collect finished relations (quick-xml's event loop above
    // only accumulates per-relation state; finalize here once ways are
    // fully known).
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut regions: Vec<ParsedRegion> = Vec::new();
    let mut buf = Vec::new();
    let mut in_relation: Option<(i64, Option<String>, String, bool, Vec<(String, String)>)> = None;
    loop {
        match reader.read_event_into(&mut buf).map_err(Error::Xml)? {
            Event::Eof => break,
            Event::Start(e) if e.name().as_ref() == b"relation" => {
                let mut id = 0i64;
                let mut action = None;
                for attr in e.attributes().flatten() {
                    let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                    let value = attr.unescape_value().unwrap_or_default().to_string();
                    if key == "id" {
                        id = value.parse().unwrap_or(0);
                    }
                    if key == "action" {
                        action = Some(value);
                    }
                }
                in_relation = Some((id, action, String::new(), false, Vec::new()));
            }
            Event::Empty(e) if e.name().as_ref() == b"tag" && in_relation.is_some() => {
                let mut k = String::new();
                let mut v = String::new();
                for attr in e.attributes().flatten() {
                    let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                    let value = attr.unescape_value().unwrap_or_default().to_string();
                    if key == "k" { k = value } else if key == "v" { v = value }
                }
                if let Some((_, _, name, disabled, tags)) = in_relation.as_mut() {
                    if k == "name" { *name = v.clone(); }
                    if k == "disabled" && v == "yes" { *disabled = true; }
                    if k == "type" { tags.push(("type".to_string(), v)); }
                }
            }
            Event::Empty(e) if e.name().as_ref() == b"member" && in_relation.is_some() => {
                let mut role = String::new();
                let mut ref_ = String::new();
                for attr in e.attributes().flatten() {
                    let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                    let value = attr.unescape_value().unwrap_or_default().to_string();
                    if key == "role" { role = value } else if key == "ref" { ref_ = value }
                }
                if let Some((_, _, _, _, tags)) = in_relation.as_mut() {
                    tags.push((format!("member:{role}"), ref_));
                }
            }
            Event::End(e) if e.name().as_ref() == b"relation" => {
                if let Some((id, action, name, disabled, tags)) = in_relation.take() {
                    if action.as_deref() == Some("delete") {
                        continue;
                    }
                    let is_multi = tags.iter().any(|(k, v)| k == "type" && v == "multipolygon");
                    if !is_multi {
                        return Err(Error::MalformedXML(format!("relation {id} is not a multipolygon")));
                    }
                    let mut outer: Vec<WayWithBbox> = Vec::new();
                    let mut inner: Vec<WayWithBbox> = Vec::new();
                    for (k, v) in &tags {
                        if let Some(role) = k.strip_prefix("member:") {
                            let way = way_info.get(v).ok_or_else(|| Error::MissingReference(v.clone()))?;
                            let copy = WayWithBbox { nodes: way.nodes.clone(), bbox: way.bbox, modified: way.modified };
                            match role {
                                "outer" => outer.push(copy),
                                "inner" => inner.push(copy),
                                _ => {}
                            }
                        }
                    }
                    if outer.is_empty() {
                        return Err(Error::MalformedXML(format!("relation {id} has no outer ways")));
                    }
                    let mut modified = id < 0 || action.as_deref() == Some("modify");
                    reassemble_rings(&mut outer)?;
                    reassemble_rings(&mut inner)?;
                    for way in outer.iter().chain(inner.iter()) {
                        if way.nodes.len() < 3 {
                            return Err(Error::DegenerateRing);
                        }
                        if way.modified {
                            modified = true;
                        }
                    }

                    let mut polygons = Vec::new();
                    let mut remaining_inner = inner;
                    for outer_ring in &outer {
                        let exterior = ring_to_linestring(&nodes, &outer_ring.nodes)?;
                        let mut interiors = Vec::new();
                        let mut i = remaining_inner.len();
                        while i > 0 {
                            i -= 1;
                            if outer_ring.bbox.contains(remaining_inner[i].bbox) {
                                let inner_ring = remaining_inner.remove(i);
                                interiors.push(ring_to_linestring(&nodes, &inner_ring.nodes)?);
                            }
                        }
                        polygons.push(Polygon::new(exterior, interiors));
                    }

                    regions.push(ParsedRegion {
                        id,
                        name: if name.is_empty() { None } else { Some(name) },
                        disabled,
                        modified,
                        geom: MultiPolygon::new(polygons),
                    });
                }
            }
            _ => {}
        }
        buf.clear();
    }

    // Unused-but-named closed ways become single-polygon regions.
    for (id, way) in &way_info {
        if ways.get(id).map(|w| w.used).unwrap_or(false) {
            continue;
        }
        let record = &ways[id];
        let name = match &record.name {
            Some(n) => n.clone(),
            None => return Err(Error::MalformedXML(format!("unused way with no name: {id}"))),
        };
        if way.nodes.first() != way.nodes.last() {
            return Err(Error::MalformedXML(format!("unused non-closed way: {id}")));
        }
        if way.nodes.len() < 3 {
            return Err(Error::DegenerateRing);
        }
        let exterior = ring_to_linestring(&nodes, &way.nodes)?;
        regions.push(ParsedRegion {
            id: id.parse().unwrap_or(0),
            name: Some(name),
            disabled: record.disabled,
            modified: way.modified,
            geom: MultiPolygon::new(vec![Polygon::new(exterior, vec![])]),
        });
    }

    Ok(regions)
}

fn ring_to_linestring(nodes: &HashMap<String, NodeRecord>, refs: &[String]) -> Result<LineString<f64>> {
    let mut coords = Vec::with_capacity(refs.len());
    for r in refs {
        let node = nodes.get(r).ok_or_else(|| Error::MissingReference(r.clone()))?;
        coords.push(Coord { x: node.lon, y: node.lat });
    }
    Ok(LineString::new(coords))
}

/// Repeatedly joins fragments until each forms a closed ring, per
/// `_append_way`'s reassembly loop; fails with `UnconnectedWay` on a dead
/// end.
fn reassemble_rings(ways: &mut Vec<WayWithBbox>) -> Result<()> {
    let mut i = 0;
    while i < ways.len() {
        while ways[i].nodes.first() != ways[i].nodes.last() {
            let mut productive = false;
            let mut j = i + 1;
            while ways[i].nodes.first() != ways[i].nodes.last() && j < ways.len() {
                if let Some(joined) = append_way(&ways[i].nodes, &ways[j].nodes) {
                    let modified = ways[i].modified || ways[j].modified;
                    let other_bbox = ways[j].bbox;
                    ways[i].nodes = joined;
                    ways[i].modified = modified;
                    ways[i].bbox.extend_bbox(other_bbox);
                    ways.remove(j);
                    productive = true;
                } else {
                    j += 1;
                }
            }
            if !productive {
                return Err(Error::UnconnectedWay(format!("fragment at index {i}")));
            }
        }
        i += 1;
    }
    Ok(())
}
