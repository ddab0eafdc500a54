//! Project documents.
//!
//! A project is stored as one JSON object: the serialized [`ProjectState`]
//! plus a top-level `version` field. Plugin state blobs travel inside their
//! slots.

use std::fs;
use std::path::Path;

use serde_json::Value;
use tracing::{debug, info};

use crate::error::{PersistenceError, VersionedMigrationError};
use crate::model::ProjectState;

/// Schema version written by this build. Documents with any other version
/// are rejected.
pub const PROJECT_SCHEMA_VERSION: u64 = 1;

const VERSION_KEY: &str = "version";

pub fn serialize(project: &ProjectState) -> Result<Value, PersistenceError> {
    let mut document = serde_json::to_value(project)?;
    if let Value::Object(map) = &mut document {
        map.insert(VERSION_KEY.to_owned(), Value::from(PROJECT_SCHEMA_VERSION));
    }
    Ok(document)
}

pub fn deserialize(mut document: Value) -> Result<ProjectState, VersionedMigrationError> {
    let version = match &mut document {
        Value::Object(map) => map.remove(VERSION_KEY),
        _ => None,
    }
    .ok_or(VersionedMigrationError::MissingVersion)?;
    let found = version.as_u64().ok_or(VersionedMigrationError::MissingVersion)?;
    if found != PROJECT_SCHEMA_VERSION {
        return Err(VersionedMigrationError::UnsupportedVersion {
            found,
            supported: PROJECT_SCHEMA_VERSION,
        });
    }
    let mut project: ProjectState = serde_json::from_value(document)?;
    project.observe_ids();
    project
        .ensure_invariants()
        .map_err(|err| VersionedMigrationError::Inconsistent(err.to_string()))?;
    debug!(tracks = project.tracks.len(), "project document decoded");
    Ok(project)
}

/// Writes the project as pretty JSON. The file is replaced atomically.
pub fn save_project(project: &ProjectState, path: &Path) -> Result<(), PersistenceError> {
    let document = serialize(project)?;
    let text = serde_json::to_string_pretty(&document)?;
    let staging = path.with_extension("tmp");
    fs::write(&staging, text)?;
    fs::rename(&staging, path)?;
    info!(path = %path.display(), "project saved");
    Ok(())
}

pub fn load_project(path: &Path) -> Result<ProjectState, PersistenceError> {
    let text = fs::read_to_string(path)?;
    let document: Value = serde_json::from_str(&text).map_err(VersionedMigrationError::Malformed)?;
    let project = deserialize(document)?;
    info!(path = %path.display(), name = %project.name, "project loaded");
    Ok(project)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::run;
    use crate::actions::{AddPlugin, CreateTrack};
    use crate::model::{SlotKind, TrackKind};
    use cadenza_plugin_host::builtin;

    fn project() -> ProjectState {
        let mut project = ProjectState::new("doc", 44_100);
        run(&mut project, &CreateTrack::new(TrackKind::Audio, "Vox")).unwrap();
        let track = project.tracks[1].id;
        run(
            &mut project,
            &AddPlugin::new(track, SlotKind::Insert, 0, builtin::gain_descriptor()),
        )
        .unwrap();
        project
    }

    #[test]
    fn documents_carry_the_version() {
        let document = serialize(&project()).unwrap();
        assert_eq!(document["version"], PROJECT_SCHEMA_VERSION);
        assert_eq!(deserialize(document).unwrap(), project());
    }

    #[test]
    fn other_versions_are_rejected() {
        let mut document = serialize(&project()).unwrap();
        document["version"] = Value::from(PROJECT_SCHEMA_VERSION + 1);
        assert!(matches!(
            deserialize(document),
            Err(VersionedMigrationError::UnsupportedVersion { found, .. }) if found == PROJECT_SCHEMA_VERSION + 1
        ));
    }

    #[test]
    fn missing_version_is_rejected() {
        let mut document = serialize(&project()).unwrap();
        document.as_object_mut().unwrap().remove("version");
        assert!(matches!(deserialize(document), Err(VersionedMigrationError::MissingVersion)));
    }

    #[test]
    fn inconsistent_documents_are_rejected() {
        let mut broken = project();
        broken.tracks.clear();
        let document = serialize(&broken).unwrap();
        assert!(matches!(deserialize(document), Err(VersionedMigrationError::Inconsistent(_))));
    }
}
