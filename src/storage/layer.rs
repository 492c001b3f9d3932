//! Layers and their location payload codecs
//!
//! A layer pairs a [`LayerId`] with the [`LayerCodec`] that turns a
//! [`LocationInfo`] into payload bytes. Payloads never inline another
//! location; they store its pool id and resolve it back on read.
//!
//! ```text
//! ReverseEdges         count:i32, sourceId:i32*
//! BidirectionalEdges   count:i32, sourceId:i32*, count:i32, destinationId:i32*
//! ```

use super::codec::{as_codec_error, get_id, get_len, put_id, put_len};
use super::model::{LayerId, Location, LocationInfo};
use crate::error::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Location pool access while a payload is encoded
pub trait LocationInterner {
    /// Pool id for `location`, interning it if needed
    fn intern(&mut self, location: &Location) -> u32;
}

/// Location pool access while a payload is decoded
pub trait LocationResolver {
    /// Location for a stored id; `Ok(None)` when it has been deleted since
    fn resolve(&self, id: u32) -> Result<Option<Location>>;
}

/// Payload format of one layer
pub trait LayerCodec: Send + Sync + fmt::Debug {
    fn encode(&self, info: &LocationInfo, refs: &mut dyn LocationInterner) -> Result<Bytes>;

    fn decode(&self, payload: &[u8], refs: &dyn LocationResolver) -> Result<LocationInfo>;
}

/// A category of facts and the codec for its payloads
#[derive(Debug, Clone)]
pub struct Layer {
    id: LayerId,
    codec: Arc<dyn LayerCodec>,
}

impl Layer {
    pub fn new(id: LayerId, codec: Arc<dyn LayerCodec>) -> Self {
        Self { id, codec }
    }

    /// Layer storing only incoming edges
    pub fn reverse_edges(id: impl Into<String>) -> Self {
        Self::new(LayerId::new(id), Arc::new(ReverseEdgesCodec))
    }

    /// Layer storing incoming and outgoing edges
    pub fn bidirectional_edges(id: impl Into<String>) -> Self {
        Self::new(LayerId::new(id), Arc::new(BidirectionalEdgesCodec))
    }

    pub fn id(&self) -> &LayerId {
        &self.id
    }

    pub fn codec(&self) -> &dyn LayerCodec {
        self.codec.as_ref()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReverseEdgesCodec;

#[derive(Debug, Clone, Copy, Default)]
pub struct BidirectionalEdgesCodec;

impl LayerCodec for ReverseEdgesCodec {
    fn encode(&self, info: &LocationInfo, refs: &mut dyn LocationInterner) -> Result<Bytes> {
        let mut out = BytesMut::new();
        put_locations(&mut out, &info.sources, true, refs);
        Ok(out.freeze())
    }

    fn decode(&self, mut payload: &[u8], refs: &dyn LocationResolver) -> Result<LocationInfo> {
        let sources = get_locations(&mut payload, "sources", refs)?;
        ensure_consumed(payload)?;
        Ok(LocationInfo::with_sources(sources))
    }
}

impl LayerCodec for BidirectionalEdgesCodec {
    fn encode(&self, info: &LocationInfo, refs: &mut dyn LocationInterner) -> Result<Bytes> {
        let mut out = BytesMut::new();
        put_locations(&mut out, &info.sources, true, refs);
        put_locations(&mut out, &info.destinations, false, refs);
        Ok(out.freeze())
    }

    fn decode(&self, mut payload: &[u8], refs: &dyn LocationResolver) -> Result<LocationInfo> {
        let sources = get_locations(&mut payload, "sources", refs)?;
        let destinations = get_locations(&mut payload, "destinations", refs)?;
        ensure_consumed(payload)?;
        Ok(LocationInfo {
            sources,
            destinations,
        })
    }
}

fn put_locations(out: &mut BytesMut, locations: &[Location], dedup: bool, refs: &mut dyn LocationInterner) {
    let mut seen = HashSet::new();
    let ids: Vec<u32> = locations
        .iter()
        .map(|l| refs.intern(l))
        .filter(|&id| !dedup || seen.insert(id))
        .collect();
    put_len(out, ids.len());
    for id in ids {
        put_id(out, id);
    }
}

fn get_locations(buf: &mut &[u8], what: &str, refs: &dyn LocationResolver) -> Result<Vec<Location>> {
    let count = get_len(buf, what).map_err(as_codec_error)?;
    let mut locations = Vec::with_capacity(count.min(buf.remaining() / 4));
    for _ in 0..count {
        let id = get_id(buf, what).map_err(as_codec_error)?;
        if let Some(location) = refs.resolve(id)? {
            locations.push(location);
        }
    }
    Ok(locations)
}

fn ensure_consumed(payload: &[u8]) -> Result<()> {
    if !payload.is_empty() {
        return Err(Error::Codec(format!(
            "{} trailing bytes after location payload",
            payload.len()
        )));
    }
    Ok(())
}
