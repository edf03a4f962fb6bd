//! Connector to plane pipe allocation.

use tracing::{debug, info};

use crate::backend::{ModeInfo, ObjectId, PlaneKind, Resources};
use crate::registry::{ResourceKind, ResourceRegistry};

/// Pipe binding failure.
#[derive(thiserror::Error, PartialEq, Eq, Debug)]
pub enum BindError {
    #[error("no free connector named {0:?}")]
    NoConnector(String),
    #[error("no free encoder for connector {0}")]
    NoEncoder(ObjectId),
    #[error("no free CRTC for encoder {0}")]
    NoCrtc(ObjectId),
    #[error("no free {kind:?} plane for CRTC {crtc}")]
    NoPlane { crtc: ObjectId, kind: PlaneKind },
    #[error("pipe has no bound {0}")]
    Unbound(ResourceKind),
    #[error("connector {connector} has no mode named {name:?}")]
    NoMode { connector: ObjectId, name: String },
}

/// Claimed resource.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Claim {
    pub id: ObjectId,
    /// Index into the backend's resource list.
    pub index: usize,
}

/// Chain of claimed connector, encoder, CRTC and plane.
#[derive(Default, PartialEq, Eq, Debug)]
pub struct Pipe {
    pub connector: Option<Claim>,
    pub encoder: Option<Claim>,
    pub crtc: Option<Claim>,
    pub plane: Option<Claim>,
}

impl Pipe {
    /// Check if every stage of the pipe is claimed.
    pub fn is_bound(&self) -> bool {
        self.connector.is_some()
            && self.encoder.is_some()
            && self.crtc.is_some()
            && self.plane.is_some()
    }

    pub fn connector_id(&self) -> ObjectId {
        self.connector.map_or(0, |claim| claim.id)
    }

    pub fn encoder_id(&self) -> ObjectId {
        self.encoder.map_or(0, |claim| claim.id)
    }

    pub fn crtc_id(&self) -> ObjectId {
        self.crtc.map_or(0, |claim| claim.id)
    }

    pub fn plane_id(&self) -> ObjectId {
        self.plane.map_or(0, |claim| claim.id)
    }

    /// Return every held resource to the registry.
    ///
    /// Releasing an already released pipe is a no-op.
    pub fn release(&mut self, registry: &mut ResourceRegistry) {
        let slots = [
            (ResourceKind::Plane, self.plane.take()),
            (ResourceKind::Crtc, self.crtc.take()),
            (ResourceKind::Encoder, self.encoder.take()),
            (ResourceKind::Connector, self.connector.take()),
        ];

        for (kind, claim) in slots {
            if let Some(claim) = claim {
                registry.release(kind, claim.index);
            }
        }
    }
}

/// Resource graph walker.
///
/// Every claim first tries to reuse whatever the hardware currently has wired
/// to the upstream object, falling back to the first free compatible resource.
pub struct PipeBinder<'a> {
    resources: &'a Resources,
    registry: &'a mut ResourceRegistry,
}

impl<'a> PipeBinder<'a> {
    pub fn new(resources: &'a Resources, registry: &'a mut ResourceRegistry) -> Self {
        Self { resources, registry }
    }

    /// Claim a full pipe for the connector `name`.
    ///
    /// On failure, all resources claimed for this pipe are released again.
    pub fn bind(&mut self, name: &str) -> Result<Pipe, BindError> {
        let mut pipe = Pipe::default();

        match self.bind_chain(&mut pipe, name) {
            Ok(()) => {
                info!(
                    "Bound {name}: connector={} encoder={} crtc={} plane={}",
                    pipe.connector_id(),
                    pipe.encoder_id(),
                    pipe.crtc_id(),
                    pipe.plane_id(),
                );
                Ok(pipe)
            },
            Err(err) => {
                pipe.release(self.registry);
                Err(err)
            },
        }
    }

    fn bind_chain(&mut self, pipe: &mut Pipe, name: &str) -> Result<(), BindError> {
        self.claim_connector(pipe, name)?;
        self.claim_encoder(pipe)?;
        self.claim_crtc(pipe)?;
        self.claim_plane(pipe, PlaneKind::Overlay)
    }

    /// Claim the first free connector called `name`.
    pub fn claim_connector(&mut self, pipe: &mut Pipe, name: &str) -> Result<(), BindError> {
        if pipe.connector.is_some() {
            return Ok(());
        }

        let index = self
            .resources
            .connectors
            .iter()
            .enumerate()
            .filter(|(index, _)| !self.registry.is_claimed(ResourceKind::Connector, *index))
            .find(|(_, connector)| connector.name == name)
            .map(|(index, _)| index)
            .ok_or_else(|| BindError::NoConnector(name.into()))?;

        let claim = self.claim(ResourceKind::Connector, index);
        pipe.connector = Some(claim.ok_or_else(|| BindError::NoConnector(name.into()))?);
        debug!("Picked connector [{index}] id={} name={name:?}", pipe.connector_id());

        Ok(())
    }

    /// Claim an encoder for the pipe's connector.
    pub fn claim_encoder(&mut self, pipe: &mut Pipe) -> Result<(), BindError> {
        if pipe.encoder.is_some() {
            return Ok(());
        }

        let connector_claim = pipe.connector.ok_or(BindError::Unbound(ResourceKind::Connector))?;
        let connector = &self.resources.connectors[connector_claim.index];

        // Prefer the encoder which is already driving the connector.
        let current = connector.encoder.and_then(|id| self.resources.encoder_index(id));
        let index = current
            .filter(|&index| self.encoder_usable(index))
            .or_else(|| {
                connector
                    .encoders
                    .iter()
                    .filter_map(|&id| self.resources.encoder_index(id))
                    .find(|&index| self.encoder_usable(index))
            })
            .ok_or(BindError::NoEncoder(connector.id))?;
        let connector_id = connector.id;

        let claim = self.claim(ResourceKind::Encoder, index);
        pipe.encoder = Some(claim.ok_or(BindError::NoEncoder(connector_id))?);
        debug!("Picked encoder [{index}] id={}", pipe.encoder_id());

        Ok(())
    }

    /// Claim a CRTC for the pipe's encoder.
    pub fn claim_crtc(&mut self, pipe: &mut Pipe) -> Result<(), BindError> {
        if pipe.crtc.is_some() {
            return Ok(());
        }

        let encoder_claim = pipe.encoder.ok_or(BindError::Unbound(ResourceKind::Encoder))?;
        let encoder = &self.resources.encoders[encoder_claim.index];
        let compatible = |index: usize| mask_contains(encoder.possible_crtcs, index);

        // Prefer the CRTC which is already feeding the encoder.
        let current = encoder.crtc.and_then(|id| self.resources.crtc_index(id));
        let index = current
            .filter(|&index| !self.registry.is_claimed(ResourceKind::Crtc, index))
            .or_else(|| {
                (0..self.resources.crtcs.len()).find(|&index| {
                    compatible(index) && !self.registry.is_claimed(ResourceKind::Crtc, index)
                })
            })
            .ok_or(BindError::NoCrtc(encoder.id))?;

        let encoder_id = encoder.id;
        let claim = self.claim(ResourceKind::Crtc, index);
        pipe.crtc = Some(claim.ok_or(BindError::NoCrtc(encoder_id))?);
        debug!("Picked crtc [{index}] id={}", pipe.crtc_id());

        Ok(())
    }

    /// Claim a plane of the requested kind for the pipe's CRTC.
    pub fn claim_plane(&mut self, pipe: &mut Pipe, kind: PlaneKind) -> Result<(), BindError> {
        if pipe.plane.is_some() {
            return Ok(());
        }

        let crtc = pipe.crtc.ok_or(BindError::Unbound(ResourceKind::Crtc))?;
        let planes = &self.resources.planes;
        let free = |index: usize| {
            planes[index].kind == kind && !self.registry.is_claimed(ResourceKind::Plane, index)
        };

        // Prefer a plane which is already attached to the CRTC.
        let compatible = |index: usize| mask_contains(planes[index].possible_crtcs, crtc.index);
        let index = (0..planes.len())
            .find(|&index| planes[index].crtc == Some(crtc.id) && free(index))
            .or_else(|| (0..planes.len()).find(|&index| compatible(index) && free(index)))
            .ok_or(BindError::NoPlane { crtc: crtc.id, kind })?;

        let claim = self.claim(ResourceKind::Plane, index);
        pipe.plane = Some(claim.ok_or(BindError::NoPlane { crtc: crtc.id, kind })?);
        debug!("Picked plane [{index}] id={}", pipe.plane_id());

        Ok(())
    }

    /// Check if an encoder is unclaimed and can still be fed by a free CRTC.
    fn encoder_usable(&self, index: usize) -> bool {
        if self.registry.is_claimed(ResourceKind::Encoder, index) {
            return false;
        }

        let possible_crtcs = self.resources.encoders[index].possible_crtcs;
        (0..self.resources.crtcs.len()).any(|crtc| {
            mask_contains(possible_crtcs, crtc) && !self.registry.is_claimed(ResourceKind::Crtc, crtc)
        })
    }

    fn claim(&mut self, kind: ResourceKind, index: usize) -> Option<Claim> {
        let id = match kind {
            ResourceKind::Connector => self.resources.connectors[index].id,
            ResourceKind::Encoder => self.resources.encoders[index].id,
            ResourceKind::Crtc => self.resources.crtcs[index].id,
            ResourceKind::Plane => self.resources.planes[index].id,
        };

        self.registry.claim(kind, index).then_some(Claim { id, index })
    }
}

/// Check if a `possible_crtcs` style bitmask contains an index.
fn mask_contains(mask: u32, index: usize) -> bool {
    let bit = u32::try_from(index).ok().and_then(|index| 1u32.checked_shl(index));
    bit.is_some_and(|bit| mask & bit != 0)
}

/// Find a connector mode by name.
pub fn pick_mode(resources: &Resources, pipe: &Pipe, name: &str) -> Result<ModeInfo, BindError> {
    let claim = pipe.connector.ok_or(BindError::Unbound(ResourceKind::Connector))?;
    let connector = &resources.connectors[claim.index];

    connector
        .modes
        .iter()
        .find(|mode| mode.name == name)
        .cloned()
        .ok_or_else(|| BindError::NoMode { connector: connector.id, name: name.into() })
}
