use serde::{Deserialize, Deserializer, Serialize};

/// A playable track, as reported by the playback provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub name: String,
    /// Artist names, in billing order.
    pub artists: Vec<String>,
    /// The provider uri used to start playback of this track.
    pub uri: String,
}

/// Accepts a missing, null, or partially-null track as "no track" instead of
/// failing the surrounding payload.
///
/// The server reports whatever its playback lookup returned, which can be an
/// object full of nulls when nothing is playing on the host device.
pub(crate) fn lenient_track<'de, D>(deserializer: D) -> Result<Option<Track>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;

    Ok(serde_json::from_value(value).unwrap_or(None))
}
