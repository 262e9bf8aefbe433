//! Tile set identity

use serde::{Deserialize, Serialize};

/// Group of tiles sharing layer, gridset, format and parameter set.
///
/// The id is derived from the other fields and is what pages reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileSet {
    id: String,
    layer_name: String,
    gridset_id: String,
    blob_format: String,
    parameters_id: Option<String>,
}

impl TileSet {
    pub fn new(
        layer_name: impl Into<String>,
        gridset_id: impl Into<String>,
        blob_format: impl Into<String>,
        parameters_id: Option<String>,
    ) -> Self {
        let layer_name = layer_name.into();
        let gridset_id = gridset_id.into();
        let blob_format = blob_format.into();
        let id = Self::compute_id(&layer_name, &gridset_id, &blob_format, parameters_id.as_deref());
        Self {
            id,
            layer_name,
            gridset_id,
            blob_format,
            parameters_id,
        }
    }

    fn compute_id(layer: &str, gridset: &str, format: &str, parameters_id: Option<&str>) -> String {
        match parameters_id {
            Some(p) => format!("{}#{}#{}#{}", layer, gridset, format, p),
            None => format!("{}#{}#{}", layer, gridset, format),
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn layer_name(&self) -> &str {
        &self.layer_name
    }

    #[inline]
    pub fn gridset_id(&self) -> &str {
        &self.gridset_id
    }

    #[inline]
    pub fn blob_format(&self) -> &str {
        &self.blob_format
    }

    #[inline]
    pub fn parameters_id(&self) -> Option<&str> {
        self.parameters_id.as_deref()
    }

    /// Same tile set under another layer name
    pub fn renamed(&self, new_layer: &str) -> Self {
        Self::new(
            new_layer,
            self.gridset_id.clone(),
            self.blob_format.clone(),
            self.parameters_id.clone(),
        )
    }
}

impl std::fmt::Display for TileSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TileSet[{}]", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_composition() {
        let plain = TileSet::new("topp:states", "EPSG:4326", "image/png", None);
        assert_eq!(plain.id(), "topp:states#EPSG:4326#image/png");

        let styled = TileSet::new("topp:states", "EPSG:4326", "image/png", Some("abc".into()));
        assert_eq!(styled.id(), "topp:states#EPSG:4326#image/png#abc");
        assert_ne!(plain, styled);
    }

    #[test]
    fn test_renamed_recomputes_id() {
        let ts = TileSet::new("old", "g", "f", Some("p".into()));
        let renamed = ts.renamed("new");
        assert_eq!(renamed.layer_name(), "new");
        assert_eq!(renamed.id(), "new#g#f#p");
        assert_eq!(renamed.parameters_id(), Some("p"));
    }
}
