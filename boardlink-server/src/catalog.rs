//! Board template catalog.
//!
//! A static table, loaded once at startup, that maps USB vendor/product ids
//! to a description of the board behind them: which controller and
//! programmer to hand to the flashing tool, which board family implements
//! it, and (for boards that must reboot into a separate bootloader identity
//! before they accept firmware) which catalog entry describes that
//! bootloader.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Catalog shipped with the binary.
const BUILTIN_CATALOG: &str = include_str!("device_list.json");

/// Catalog id of a board template.
pub type TemplateId = usize;

/// One catalog entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardTemplate {
    pub id: TemplateId,
    pub name: String,
    pub vendor_ids: Vec<u16>,
    pub product_ids: Vec<u16>,
    pub controller: String,
    pub programmer: String,
    /// Template the board turns into after a reboot-to-bootloader.
    pub bootloader_id: Option<TemplateId>,
    /// Board family name, resolved against the registered board descriptors.
    pub device_class: String,
}

impl BoardTemplate {
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vendor_ids.contains(&vid) && self.product_ids.contains(&pid)
    }

    pub fn has_bootloader(&self) -> bool {
        self.bootloader_id.is_some()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTemplate {
    id: TemplateId,
    name: String,
    #[serde(rename = "vendorIDs")]
    vendor_ids: Vec<String>,
    #[serde(rename = "productIDs")]
    product_ids: Vec<String>,
    controller: String,
    programmer: String,
    #[serde(rename = "bootloaderID", default)]
    bootloader_id: Option<TemplateId>,
    device_class: String,
}

/// The loaded, validated catalog. Read-only after construction.
#[derive(Debug, Clone)]
pub struct Catalog {
    templates: Vec<BoardTemplate>,
}

impl Catalog {
    /// Parse and validate a catalog from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: Vec<RawTemplate> = serde_json::from_str(text)?;

        let mut templates = Vec::with_capacity(raw.len());
        let mut seen = HashSet::new();
        for entry in raw {
            if !seen.insert(entry.id) {
                return Err(Error::Catalog(format!("duplicate template id {}", entry.id)));
            }
            templates.push(BoardTemplate {
                id: entry.id,
                vendor_ids: parse_hex_ids(&entry.name, &entry.vendor_ids)?,
                product_ids: parse_hex_ids(&entry.name, &entry.product_ids)?,
                name: entry.name,
                controller: entry.controller,
                programmer: entry.programmer,
                bootloader_id: entry.bootloader_id,
                device_class: entry.device_class,
            });
        }

        for template in &templates {
            if let Some(bootloader) = template.bootloader_id {
                if bootloader == template.id || !seen.contains(&bootloader) {
                    return Err(Error::Catalog(format!(
                        "template {} ({}) references unknown bootloader template {}",
                        template.id, template.name, bootloader
                    )));
                }
            }
        }

        Ok(Self { templates })
    }

    /// The catalog compiled into the binary.
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_CATALOG)
    }

    /// Load a custom catalog, falling back to the built-in one when the
    /// file can't be used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Self::builtin();
        };

        let custom = std::fs::read_to_string(path)
            .map_err(Error::from)
            .and_then(|text| Self::from_json(&text));

        match custom {
            Ok(catalog) => {
                info!(path = %path.display(), templates = catalog.len(), "Custom board catalog loaded");
                Ok(catalog)
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Can't use custom board catalog, falling back to the built-in one"
                );
                Self::builtin()
            }
        }
    }

    pub fn get(&self, id: TemplateId) -> Option<&BoardTemplate> {
        self.templates.iter().find(|t| t.id == id)
    }

    /// Template matching a USB vendor/product pair, if any.
    pub fn find(&self, vid: u16, pid: u16) -> Option<&BoardTemplate> {
        self.templates.iter().find(|t| t.matches(vid, pid))
    }

    pub fn templates(&self) -> &[BoardTemplate] {
        &self.templates
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

fn parse_hex_ids(name: &str, ids: &[String]) -> Result<Vec<u16>> {
    ids.iter()
        .map(|id| {
            u16::from_str_radix(id.trim_start_matches("0x"), 16).map_err(|e| {
                Error::Catalog(format!("template {}: invalid USB id '{}': {}", name, id, e))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builtin_catalog_is_valid() {
        let catalog = Catalog::builtin().unwrap();
        assert!(!catalog.is_empty());

        let leonardo = catalog.find(0x2341, 0x8036).unwrap();
        assert_eq!(leonardo.name, "Arduino Leonardo");
        let bootloader = catalog.get(leonardo.bootloader_id.unwrap()).unwrap();
        assert!(bootloader.matches(0x2341, 0x0036));
        assert!(!bootloader.has_bootloader());
    }

    #[test]
    fn test_unknown_usb_pair() {
        let catalog = Catalog::builtin().unwrap();
        assert!(catalog.find(0xdead, 0xbeef).is_none());
    }

    #[test]
    fn test_dangling_bootloader_reference_rejected() {
        let json = r#"[{"id": 0, "name": "A", "vendorIDs": ["2341"], "productIDs": ["0001"],
            "controller": "c", "programmer": "p", "bootloaderID": 9, "deviceClass": "arduino"}]"#;
        let err = Catalog::from_json(json).unwrap_err();
        assert!(matches!(err, Error::Catalog(_)));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let json = r#"[
            {"id": 1, "name": "A", "vendorIDs": [], "productIDs": [], "controller": "c", "programmer": "p", "deviceClass": "arduino"},
            {"id": 1, "name": "B", "vendorIDs": [], "productIDs": [], "controller": "c", "programmer": "p", "deviceClass": "arduino"}
        ]"#;
        assert!(Catalog::from_json(json).is_err());
    }

    #[test]
    fn test_bad_hex_rejected() {
        let json = r#"[{"id": 0, "name": "A", "vendorIDs": ["zz"], "productIDs": ["0001"],
            "controller": "c", "programmer": "p", "deviceClass": "arduino"}]"#;
        assert!(Catalog::from_json(json).is_err());
    }

    #[test]
    fn test_broken_custom_catalog_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not json").unwrap();

        let catalog = Catalog::load(Some(file.path())).unwrap();
        assert_eq!(catalog.len(), Catalog::builtin().unwrap().len());
    }

    #[test]
    fn test_custom_catalog_used() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"[{"id": 3, "name": "Only", "vendorIDs": ["0x1234"], "productIDs": ["5678"],
                "controller": "c", "programmer": "p", "deviceClass": "arduino"}]"#,
        )
        .unwrap();

        let catalog = Catalog::load(Some(file.path())).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.find(0x1234, 0x5678).unwrap().id, 3);
    }
}
