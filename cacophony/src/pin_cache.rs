//! Derives the set of addresses that must stay pinned by walking published documents and
//! the local caches.

use std::collections::HashMap;

use cacophony_base::ContentAddress;
use tracing::{debug, trace};

use crate::{
    format::{self, StreamDescription, StreamRecord, StreamRecords},
    net::{self, NetworkError, NetworkScheduler},
    projection::{
        ExplicitCacheData, FavouritesCacheData, FollowingCacheElement, PinCacheData, PinMismatch,
        Projections,
    },
};

/// Accumulates references for the home channel and each followee.
///
/// Every address is referenced once per channel that needs it, so content shared between
/// channels ends up with a count above one. Any failed read aborts the build: the builder is
/// consumed and the error returned, there is no partial result.
#[derive(Debug)]
pub struct PinCacheBuilder<'a, S: ?Sized> {
    network: &'a S,
    cache: PinCacheData,
}

impl<'a, S: NetworkScheduler + ?Sized> PinCacheBuilder<'a, S> {
    pub fn new(network: &'a S) -> Self {
        Self {
            network,
            cache: PinCacheData::new(),
        }
    }

    /// Adds everything reachable from the home channel's root, including every attachment
    /// of every post.
    pub fn add_home_user(mut self, root: ContentAddress) -> Result<Self, NetworkError> {
        debug!(%root, "pin cache: home");
        let records = self.common_start(root)?;
        let reads: Vec<_> = records
            .records
            .iter()
            .map(|record| net::read(self.network, *record, format::decode::<StreamRecord>))
            .collect();
        for read in reads {
            let record = read.get()?;
            if let Some(thumbnail) = record.thumbnail {
                self.cache.add_ref(thumbnail);
            }
            for element in &record.elements {
                self.cache.add_ref(element.address);
            }
        }
        Ok(self)
    }

    /// Adds the metadata reachable from a followee's root plus the parts of its posts that
    /// are recorded in `cached`. Post bodies are not fetched.
    pub fn add_followee(
        mut self,
        root: ContentAddress,
        cached: &HashMap<ContentAddress, FollowingCacheElement>,
    ) -> Result<Self, NetworkError> {
        debug!(%root, cached = cached.len(), "pin cache: followee");
        self.common_start(root)?;
        for element in cached.values() {
            if let Some(image) = element.image {
                self.cache.add_ref(image);
            }
            if let Some(leaf) = element.leaf {
                self.cache.add_ref(leaf);
            }
        }
        Ok(self)
    }

    /// Adds every reference held by the explicit cache. Nothing is read from the network.
    pub fn add_explicit_cache(mut self, explicit: &ExplicitCacheData) -> Self {
        debug!(entries = explicit.len(), "pin cache: explicit");
        explicit.walk_all_pins(|address| self.cache.add_ref(address));
        self
    }

    pub fn add_favourites(mut self, favourites: &FavouritesCacheData) -> Self {
        favourites.walk_all_pins(|address| self.cache.add_ref(address));
        self
    }

    pub fn finish(self) -> PinCacheData {
        self.cache
    }

    /// References the index, its three documents, the picture and every record address.
    fn common_start(&mut self, root: ContentAddress) -> Result<StreamRecords, NetworkError> {
        self.cache.add_ref(root);
        let index = net::read(self.network, root, format::decode_index).get()?;
        self.cache.add_ref(index.description);
        self.cache.add_ref(index.recommendations);
        self.cache.add_ref(index.records);

        let description = net::read(
            self.network,
            index.description,
            format::decode::<StreamDescription>,
        );
        let records = net::read(self.network, index.records, format::decode::<StreamRecords>);
        if let Some(picture) = description.get()?.picture {
            self.cache.add_ref(picture);
        }
        let records = records.get()?;
        for record in &records.records {
            self.cache.add_ref(*record);
        }
        trace!(records = records.records.len(), "walked index");
        Ok(records)
    }
}

/// Rebuilds the expected pin table from the roots recorded in the local model.
pub fn rebuild_from_model<S>(model: &Projections, network: &S) -> Result<PinCacheData, NetworkError>
where
    S: NetworkScheduler + ?Sized,
{
    let mut builder = PinCacheBuilder::new(network);
    if let Some(root) = model.channel().last_published_root() {
        builder = builder.add_home_user(root)?;
    }
    let followees = model.followees();
    for key in followees.known_followees() {
        let (Some(root), Some(cached)) = (followees.last_fetched_root(&key), followees.elements_for(&key))
        else {
            continue;
        };
        builder = builder.add_followee(root, &cached)?;
    }
    Ok(builder
        .add_explicit_cache(model.explicit_cache())
        .add_favourites(model.favourites())
        .finish())
}

/// Compares the stored pin table against one rebuilt from the network.
///
/// An empty result means the stored table is consistent.
pub fn check_consistency<S>(model: &Projections, network: &S) -> Result<Vec<PinMismatch>, NetworkError>
where
    S: NetworkScheduler + ?Sized,
{
    let expected = rebuild_from_model(model, network)?;
    let mismatches = model.pins().verify_match(&expected);
    if !mismatches.is_empty() {
        debug!(count = mismatches.len(), "pin table differs from the published graph");
    }
    Ok(mismatches)
}
