//! Index mutations and reads executed by the processor

use super::PendingOperation;
use crate::error::Result;
use crate::storage::{FileInfo, IndexStorage, Layer, Location, LocationInfo};
use std::sync::Arc;
use tracing::debug;

/// Store the facts extracted from one resource
pub struct IndexResourceOperation {
    storage: Arc<IndexStorage>,
    path: String,
    info: FileInfo,
    locations: Vec<(Location, LocationInfo, Layer)>,
}

impl IndexResourceOperation {
    pub fn new(storage: Arc<IndexStorage>, path: impl Into<String>, info: FileInfo) -> Self {
        Self {
            storage,
            path: path.into(),
            info,
            locations: Vec::new(),
        }
    }

    /// Add a location record written after the file record
    pub fn with_location(mut self, location: Location, info: LocationInfo, layer: Layer) -> Self {
        self.locations.push((location, info, layer));
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl PendingOperation for IndexResourceOperation {
    fn kind(&self) -> &'static str {
        "index-resource"
    }

    fn execute(self: Box<Self>) -> Result<()> {
        let Self {
            storage,
            path,
            info,
            locations,
        } = *self;
        storage.write_file_info(&path, &info)?;
        for (location, location_info, layer) in &locations {
            storage.write_location_info(location, location_info, layer)?;
        }
        debug!(path = %path, locations = locations.len(), "Indexed resource");
        Ok(())
    }

    fn should_drop_on_resource_removal(&self, resource: &str) -> bool {
        self.path == resource
    }
}

/// Forget a resource and the locations it declared
pub struct RemoveResourceOperation {
    storage: Arc<IndexStorage>,
    path: String,
}

impl RemoveResourceOperation {
    pub fn new(storage: Arc<IndexStorage>, path: impl Into<String>) -> Self {
        Self {
            storage,
            path: path.into(),
        }
    }
}

impl PendingOperation for RemoveResourceOperation {
    fn kind(&self) -> &'static str {
        "remove-resource"
    }

    fn execute(self: Box<Self>) -> Result<()> {
        let Some(info) = self.storage.read_file_info(&self.path)? else {
            debug!(path = %self.path, "Resource not indexed");
            return Ok(());
        };
        for location in &info.source_locations {
            self.storage.delete_location_info(location)?;
        }
        self.storage.delete_file_info(&self.path)?;
        debug!(
            path = %self.path,
            locations = info.source_locations.len(),
            "Removed resource"
        );
        Ok(())
    }

    fn removed_resource(&self) -> Option<&str> {
        Some(self.path.as_str())
    }
}

type LocationCallback = Box<dyn FnOnce(Result<Option<LocationInfo>>) + Send>;

/// Read a location in queue order, after every mutation enqueued before it
pub struct ReadLocationOperation {
    storage: Arc<IndexStorage>,
    location: Location,
    layer: Layer,
    callback: LocationCallback,
}

impl ReadLocationOperation {
    pub fn new(
        storage: Arc<IndexStorage>,
        location: Location,
        layer: Layer,
        callback: impl FnOnce(Result<Option<LocationInfo>>) + Send + 'static,
    ) -> Self {
        Self {
            storage,
            location,
            layer,
            callback: Box::new(callback),
        }
    }
}

impl PendingOperation for ReadLocationOperation {
    fn kind(&self) -> &'static str {
        "read-location"
    }

    fn execute(self: Box<Self>) -> Result<()> {
        let result = self.storage.read_location_info(&self.location, &self.layer);
        (self.callback)(result);
        Ok(())
    }
}
