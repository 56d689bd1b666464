//! Streaming loader for the `entities.xml` metadata export.
//!
//! The export is a flat list of `<object class="…">` elements. Each object has
//! an `<id name="id">` child and `<property name="…">` children whose value is
//! either text (often CDATA) or a nested `<id>` pointing at another object.
//! `<collection>` children duplicate information carried by properties and are
//! skipped.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::debug;

use crate::config::LayoutSection;
use crate::model::{ContentKind, compare_ids};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Text(String),
    Reference(String),
}

#[derive(Debug, Clone, Default)]
pub struct RawEntity {
    pub class: String,
    pub id: String,
    pub properties: BTreeMap<String, PropertyValue>,
}

impl RawEntity {
    fn text(&self, name: &str) -> Option<&str> {
        match self.properties.get(name) {
            Some(PropertyValue::Text(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    fn reference(&self, name: &str) -> Option<&str> {
        match self.properties.get(name) {
            Some(PropertyValue::Reference(value)) => Some(value.as_str()),
            _ => None,
        }
    }
}

/// A page, blog post, or attachment known to the metadata export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataNode {
    pub id: String,
    pub kind: ContentKind,
    pub title: String,
    pub parent_id: Option<String>,
    pub container_id: Option<String>,
    pub content_type: Option<String>,
    pub version: i64,
}

#[derive(Debug, Clone, Default)]
pub struct SpaceMetadata {
    pub space_key: Option<String>,
    pub space_name: Option<String>,
    pub homepage_id: Option<String>,
    pub nodes: BTreeMap<String, MetadataNode>,
    /// Historical or superseded ids pointing at the live node.
    pub aliases: BTreeMap<String, String>,
    /// Storage-format bodies of blog posts, keyed by blog post id.
    pub blog_bodies: BTreeMap<String, String>,
    pub warnings: Vec<String>,
}

impl SpaceMetadata {
    pub fn node(&self, id: &str) -> Option<&MetadataNode> {
        self.nodes.get(id)
    }
}

/// Finds the metadata file for one space under the XML export root.
pub fn locate_entities_file(
    xml_root: &Path,
    space_key: &str,
    layout: &LayoutSection,
    single_space: bool,
) -> Option<PathBuf> {
    let direct = xml_root.join(space_key).join(&layout.entities_file);
    if direct.is_file() {
        return Some(direct);
    }

    let prefix = format!("Confluence-space-export-{space_key}");
    if let Ok(entries) = fs::read_dir(xml_root) {
        let mut candidates = entries
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.starts_with(&prefix))
            })
            .map(|entry| entry.path().join(&layout.entities_file))
            .filter(|path| path.is_file())
            .collect::<Vec<_>>();
        candidates.sort();
        if let Some(found) = candidates.into_iter().next() {
            return Some(found);
        }
    }

    let shared = xml_root.join(&layout.entities_file);
    if single_space && shared.is_file() {
        return Some(shared);
    }
    None
}

pub fn load_space_metadata(path: &Path, space_key: &str) -> Result<SpaceMetadata> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let xml = String::from_utf8_lossy(&bytes);
    let entities =
        parse_entities(&xml).with_context(|| format!("failed to parse {}", path.display()))?;
    debug!(space = space_key, entities = entities.len(), "parsed metadata");
    Ok(build_space_metadata(entities, space_key))
}

/// Reads every top-level object from an entities document.
pub fn parse_entities(xml: &str) -> Result<Vec<RawEntity>> {
    let mut reader = Reader::from_str(xml);
    let mut entities = Vec::new();
    let mut current: Option<RawEntity> = None;
    let mut property: Option<(String, String, Option<String>)> = None;
    let mut id_buffer: Option<String> = None;
    let mut collection_depth = 0usize;
    let mut saw_root = false;

    loop {
        let event = reader
            .read_event()
            .with_context(|| format!("malformed XML near byte {}", reader.buffer_position()))?;
        match event {
            Event::Start(e) => {
                saw_root = true;
                match e.name().as_ref() {
                    b"object" => {
                        if current.is_some() {
                            bail!("nested <object> at byte {}", reader.buffer_position());
                        }
                        current = Some(RawEntity {
                            class: attribute(&e, b"class").unwrap_or_default(),
                            ..RawEntity::default()
                        });
                    }
                    b"collection" => collection_depth += 1,
                    b"id" if current.is_some() && collection_depth == 0 => {
                        id_buffer = Some(String::new());
                    }
                    b"property" if current.is_some() && collection_depth == 0 => {
                        if let Some(name) = attribute(&e, b"name") {
                            property = Some((name, String::new(), None));
                        }
                    }
                    _ => {}
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"object" => {
                    if let Some(entity) = current.take()
                        && !entity.id.is_empty()
                    {
                        entities.push(entity);
                    }
                    property = None;
                    collection_depth = 0;
                }
                b"collection" => collection_depth = collection_depth.saturating_sub(1),
                b"id" => {
                    if let Some(value) = id_buffer.take() {
                        let value = value.trim().to_string();
                        if let Some((_, _, reference)) = property.as_mut() {
                            *reference = Some(value);
                        } else if let Some(entity) = current.as_mut() {
                            entity.id = value;
                        }
                    }
                }
                b"property" if collection_depth == 0 => {
                    if let Some((name, text, reference)) = property.take()
                        && let Some(entity) = current.as_mut()
                    {
                        let value = match reference {
                            Some(id) => PropertyValue::Reference(id),
                            None => PropertyValue::Text(text.trim().to_string()),
                        };
                        entity.properties.insert(name, value);
                    }
                }
                _ => {}
            },
            Event::Empty(e) => {
                saw_root = true;
                if e.name().as_ref() == b"object" {
                    debug!("skipping empty <object/>");
                }
            }
            Event::Text(e) => push_text(
                &mut id_buffer,
                &mut property,
                &String::from_utf8_lossy(e.as_ref()),
            ),
            Event::CData(e) => {
                push_text(&mut id_buffer, &mut property, &String::from_utf8_lossy(&e))
            }
            Event::GeneralRef(e) => {
                let entity = String::from_utf8_lossy(e.as_ref());
                if let Some(resolved) = resolve_entity(&entity) {
                    push_text(&mut id_buffer, &mut property, &resolved);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        bail!("document has no root element");
    }
    if current.is_some() {
        bail!("unterminated <object> at end of document");
    }
    Ok(entities)
}

fn push_text(
    id_buffer: &mut Option<String>,
    property: &mut Option<(String, String, Option<String>)>,
    text: &str,
) {
    if let Some(buffer) = id_buffer.as_mut() {
        buffer.push_str(text);
    } else if let Some((_, buffer, _)) = property.as_mut() {
        buffer.push_str(text);
    }
}

fn attribute(element: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == key)
        .map(|attr| String::from_utf8_lossy(&attr.value).to_string())
}

fn resolve_entity(entity: &str) -> Option<String> {
    match entity {
        "apos" => return Some("'".to_string()),
        "quot" => return Some("\"".to_string()),
        "lt" => return Some("<".to_string()),
        "gt" => return Some(">".to_string()),
        "amp" => return Some("&".to_string()),
        _ => {}
    }
    let numeric = entity.strip_prefix('#')?;
    let code = match numeric.strip_prefix(['x', 'X']) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => numeric.parse::<u32>().ok()?,
    };
    char::from_u32(code).map(|ch| ch.to_string())
}

/// Turns raw entities into the cleaned node set of one space.
pub fn build_space_metadata(entities: Vec<RawEntity>, space_key: &str) -> SpaceMetadata {
    let mut metadata = SpaceMetadata::default();

    let spaces = entities
        .iter()
        .filter(|entity| entity.class == "Space")
        .collect::<Vec<_>>();
    let own_space = spaces
        .iter()
        .find(|entity| entity.text("key") == Some(space_key))
        .or_else(|| if spaces.len() == 1 { spaces.first() } else { None })
        .copied();
    if let Some(space) = own_space {
        metadata.space_key = space.text("key").map(ToString::to_string);
        metadata.space_name = space.text("name").map(ToString::to_string);
        metadata.homepage_id = space.reference("homePage").map(ToString::to_string);
    }
    let own_space_id = own_space.map(|space| space.id.as_str());

    let mut bodies = BTreeMap::new();
    let mut historical = Vec::new();
    for entity in &entities {
        let kind = match entity.class.as_str() {
            "Page" => ContentKind::Page,
            "BlogPost" => ContentKind::BlogPost,
            "Attachment" => ContentKind::Attachment,
            "BodyContent" => {
                if let (Some(content), Some(body)) =
                    (entity.reference("content"), entity.text("body"))
                {
                    bodies.insert(content.to_string(), body.to_string());
                }
                continue;
            }
            _ => continue,
        };

        let status = entity.text("contentStatus").unwrap_or("current");
        if status.eq_ignore_ascii_case("draft") || status.eq_ignore_ascii_case("deleted") {
            metadata
                .warnings
                .push(format!("skipped {status} {} {}", entity.class, entity.id));
            continue;
        }
        if kind != ContentKind::Attachment
            && let (Some(own), Some(space)) = (own_space_id, entity.reference("space"))
            && own != space
        {
            continue;
        }
        if let Some(original) = entity.reference("originalVersion") {
            historical.push((entity.id.clone(), original.to_string()));
            continue;
        }

        let title = entity.text("title").unwrap_or_default().to_string();
        metadata.nodes.insert(
            entity.id.clone(),
            MetadataNode {
                id: entity.id.clone(),
                kind,
                title,
                parent_id: entity.reference("parent").map(ToString::to_string),
                container_id: entity.reference("containerContent").map(ToString::to_string),
                content_type: entity
                    .text("contentType")
                    .or_else(|| entity.text("mediaType"))
                    .map(ToString::to_string),
                version: entity
                    .text("hibernateVersion")
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(0),
            },
        );
    }

    // Attachments belong to this space only through a kept container.
    let document_ids = metadata
        .nodes
        .values()
        .filter(|node| node.kind.is_document())
        .map(|node| node.id.clone())
        .collect::<HashSet<_>>();
    metadata.nodes.retain(|_, node| {
        node.kind != ContentKind::Attachment
            || node
                .container_id
                .as_ref()
                .is_some_and(|container| document_ids.contains(container))
    });

    for (old_id, current_id) in historical {
        if metadata.nodes.contains_key(&current_id) {
            metadata.aliases.insert(old_id, current_id);
        }
    }

    collapse_duplicate_titles(&mut metadata);

    for (id, body) in bodies {
        if metadata
            .nodes
            .get(&id)
            .is_some_and(|node| node.kind == ContentKind::BlogPost)
        {
            metadata.blog_bodies.insert(id, body);
        }
    }

    let known = metadata.nodes.keys().cloned().collect::<HashSet<_>>();
    for node in metadata.nodes.values_mut() {
        if let Some(parent) = node.parent_id.as_ref()
            && !known.contains(parent)
        {
            node.parent_id = None;
        }
    }
    let cycle_warnings = break_parent_cycles(&mut metadata.nodes);
    metadata.warnings.extend(cycle_warnings);

    if let Some(homepage) = metadata.homepage_id.clone()
        && !metadata.nodes.contains_key(&homepage)
    {
        metadata.homepage_id = metadata.aliases.get(&homepage).cloned();
    }
    metadata
}

/// Keeps the highest-versioned document per (kind, title); the rest alias to it.
fn collapse_duplicate_titles(metadata: &mut SpaceMetadata) {
    let mut winners: BTreeMap<(ContentKind, String), String> = BTreeMap::new();
    let mut ids = metadata
        .nodes
        .values()
        .filter(|node| node.kind.is_document() && !node.title.is_empty())
        .map(|node| node.id.clone())
        .collect::<Vec<_>>();
    ids.sort_by(|left, right| compare_ids(left, right));

    let mut losers = Vec::new();
    for id in ids {
        let Some(node) = metadata.nodes.get(&id) else {
            continue;
        };
        let key = (node.kind, node.title.clone());
        match winners.get(&key) {
            None => {
                winners.insert(key, id);
            }
            Some(existing) => {
                let existing_version = metadata.nodes.get(existing).map_or(0, |n| n.version);
                if node.version > existing_version {
                    losers.push((existing.clone(), id.clone()));
                    winners.insert(key, id);
                } else {
                    losers.push((id, existing.clone()));
                }
            }
        }
    }

    for (loser, winner) in losers {
        let winner = winners
            .values()
            .find(|candidate| {
                metadata.nodes.get(*candidate).map(|n| (n.kind, &n.title))
                    == metadata.nodes.get(&winner).map(|n| (n.kind, &n.title))
            })
            .cloned()
            .unwrap_or(winner);
        if let Some(node) = metadata.nodes.remove(&loser) {
            metadata.warnings.push(format!(
                "duplicate title `{}`: {loser} superseded by {winner}",
                node.title
            ));
        }
        metadata.aliases.insert(loser.clone(), winner.clone());
        for node in metadata.nodes.values_mut() {
            if node.parent_id.as_deref() == Some(loser.as_str()) {
                node.parent_id = Some(winner.clone());
            }
            if node.container_id.as_deref() == Some(loser.as_str()) {
                node.container_id = Some(winner.clone());
            }
        }
    }
    let aliases = metadata.aliases.clone();
    for target in metadata.aliases.values_mut() {
        for _ in 0..aliases.len() {
            match aliases.get(target.as_str()) {
                Some(next) if next != target => *target = next.clone(),
                _ => break,
            }
        }
    }
}

/// Drops the parent edge that closes each cycle. Nodes are visited in id order
/// so the dropped edge is the same on every run.
pub fn break_parent_cycles(nodes: &mut BTreeMap<String, MetadataNode>) -> Vec<String> {
    let mut ids = nodes.keys().cloned().collect::<Vec<_>>();
    ids.sort_by(|left, right| compare_ids(left, right));

    let mut warnings = Vec::new();
    let mut settled = HashSet::new();
    for start in ids {
        let mut path = Vec::new();
        let mut on_path = HashSet::new();
        let mut cursor = Some(start);
        while let Some(id) = cursor {
            if settled.contains(&id) {
                break;
            }
            if !on_path.insert(id.clone()) {
                if let Some(closing) = path.last().cloned()
                    && let Some(node) = nodes.get_mut(&closing)
                {
                    node.parent_id = None;
                    warnings.push(format!(
                        "parent cycle broken: dropped edge {closing} -> {id}"
                    ));
                }
                break;
            }
            path.push(id.clone());
            cursor = nodes.get(&id).and_then(|node| node.parent_id.clone());
        }
        settled.extend(path);
    }
    warnings
}
