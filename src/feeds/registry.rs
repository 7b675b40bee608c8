//! NDBC station registry loaded from `activestations.xml`.

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::collections::HashMap;
use tracing::info;

use crate::error::FeedError;
use crate::model::PlatformType;

/// Maps an NDBC station `type` attribute onto the five-way taxonomy.
pub fn normalize_ndbc_type(raw: &str) -> PlatformType {
    match raw.trim().to_lowercase().as_str() {
        "buoy" | "dart" | "tao" => PlatformType::Buoy,
        "fixed" | "oilrig" => PlatformType::Shore,
        "usv" => PlatformType::Drifter,
        _ => PlatformType::Other,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StationMeta {
    pub name: String,
    pub platform_type: PlatformType,
    pub owner: String,
}

#[derive(Debug, Clone, Default)]
pub struct StationRegistry {
    stations: HashMap<String, StationMeta>,
}

impl StationRegistry {
    /// Parses every `<station>` element in the document, at any depth.
    ///
    /// Elements without an `id` are skipped. A missing `type` reads as `other`.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Registry`] if the XML is malformed, truncated, or has no root element.
    pub fn from_xml(xml: &str) -> Result<Self, FeedError> {
        let mut reader = Reader::from_str(xml);
        let mut registry = Self::default();
        let mut saw_element = false;
        let mut depth = 0usize;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    saw_element = true;
                    depth += 1;
                    if e.name().as_ref() == b"station" {
                        registry.insert_element(&e)?;
                    }
                }
                Ok(Event::Empty(e)) => {
                    saw_element = true;
                    if e.name().as_ref() == b"station" {
                        registry.insert_element(&e)?;
                    }
                }
                Ok(Event::End(_)) => depth = depth.saturating_sub(1),
                Ok(Event::Eof) if depth > 0 => {
                    return Err(FeedError::registry("document ends inside an open element"));
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(FeedError::registry(e.to_string())),
            }
        }

        if !saw_element {
            return Err(FeedError::registry("document has no root element"));
        }
        info!(stations = registry.len(), "Loaded NDBC station metadata");
        Ok(registry)
    }

    fn insert_element(&mut self, e: &BytesStart<'_>) -> Result<(), FeedError> {
        let id = attr(e, "id")?;
        let id = id.trim();
        if id.is_empty() {
            return Ok(());
        }
        let raw_type = attr(e, "type")?;
        let raw_type = if raw_type.trim().is_empty() { "other" } else { raw_type.as_str() };
        self.insert(
            id,
            StationMeta {
                name: attr(e, "name")?,
                platform_type: normalize_ndbc_type(raw_type),
                owner: attr(e, "owner")?,
            },
        );
        Ok(())
    }

    pub fn insert(&mut self, id: impl Into<String>, meta: StationMeta) {
        self.stations.insert(id.into(), meta);
    }

    pub fn get(&self, id: &str) -> Option<&StationMeta> {
        self.stations.get(id)
    }

    /// Platform type for `id`, defaulting to buoy for stations not in the registry.
    pub fn type_of(&self, id: &str) -> PlatformType {
        self.get(id)
            .map(|meta| meta.platform_type)
            .unwrap_or(PlatformType::Buoy)
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }
}

fn attr(e: &BytesStart<'_>, name: &str) -> Result<String, FeedError> {
    match e.try_get_attribute(name) {
        Ok(Some(a)) => a
            .unescape_value()
            .map(|v| v.into_owned())
            .map_err(|err| FeedError::registry(err.to_string())),
        Ok(None) => Ok(String::new()),
        Err(err) => Err(FeedError::registry(err.to_string())),
    }
}
