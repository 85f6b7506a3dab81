//! Parent-chain resolution: walk a differencing image's locator hints,
//! verify each parent's identity, and stack the layers into one content
//! stream.

use std::cell::RefCell;
use std::rc::Rc;

use vdisk_core::{LayeredStream, Ownership, Result, SparseStream, VdError};

use crate::image::{ImageContentStream, ImageFile, VdkImage};
use crate::locator::{FileAccess, FileLocator};

/// Opens one image file of some concrete format through a locator.
pub trait OpenImage {
    fn open(
        &self,
        locator: &dyn FileLocator,
        path: &str,
        access: FileAccess,
    ) -> Result<Rc<RefCell<dyn ImageFile>>>;
}

/// Opener for the native format.
#[derive(Copy, Clone, Debug, Default)]
pub struct VdkOpener;

impl OpenImage for VdkOpener {
    fn open(
        &self,
        locator: &dyn FileLocator,
        path: &str,
        access: FileAccess,
    ) -> Result<Rc<RefCell<dyn ImageFile>>> {
        let stream = locator.open(path, access)?;
        let image = VdkImage::open(stream, &locator.resolve_absolute(path))?;
        Ok(Rc::new(RefCell::new(image)))
    }
}

/// One layer of a resolved chain, with its teardown responsibility.
pub struct ChainLayer {
    image: Rc<RefCell<dyn ImageFile>>,
    ownership: Ownership,
}

impl std::fmt::Debug for ChainLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainLayer")
            .field("image", &"<image>")
            .field("ownership", &self.ownership)
            .finish()
    }
}

impl ChainLayer {
    pub fn image(&self) -> Rc<RefCell<dyn ImageFile>> {
        self.image.clone()
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }
}

/// A fully resolved image chain, child first, deepest ancestor last.
///
/// Layers the chain opened itself are tagged `Dispose` and closed when the
/// chain is torn down; layers handed in by the caller keep the tag the
/// caller chose, so a parent shared between several chains is never closed
/// twice.
#[derive(Debug)]
pub struct DiskChain {
    layers: Vec<ChainLayer>,
}

impl DiskChain {
    /// Open `path` and walk its parent locators until a self-contained
    /// ancestor is reached. On any failure every image opened so far is
    /// closed, in reverse open order, before the error is returned.
    pub fn resolve(
        locator: &dyn FileLocator,
        path: &str,
        access: FileAccess,
        opener: &dyn OpenImage,
    ) -> Result<Self> {
        let top = opener.open(locator, path, access)?;
        let mut layers = vec![ChainLayer {
            image: top,
            ownership: Ownership::Dispose,
        }];

        loop {
            let (needs_parent, parent_id, hints, cur_path) = {
                let cur = layers.last().expect("chain is never empty").image.borrow();
                (
                    cur.needs_parent(),
                    cur.parent_unique_id(),
                    cur.parent_location_hints(),
                    cur.full_path(),
                )
            };
            if !needs_parent {
                break;
            }

            let mut matched = false;
            for hint in &hints {
                if !locator.exists(hint) {
                    tracing::trace!(hint, "parent hint does not resolve");
                    continue;
                }
                let candidate = match opener.open(locator, hint, FileAccess::Read) {
                    Ok(candidate) => candidate,
                    Err(err) => {
                        close_all(&layers);
                        return Err(err);
                    }
                };
                let (found, found_path) = {
                    let c = candidate.borrow();
                    (c.unique_id(), c.full_path())
                };
                if found != parent_id {
                    candidate.borrow_mut().close();
                    close_all(&layers);
                    return Err(VdError::ChainMismatch {
                        expected: parent_id,
                        found,
                        path: found_path,
                    });
                }
                tracing::debug!(parent = %found, path = %found_path, "parent image resolved");
                layers.push(ChainLayer {
                    image: candidate,
                    ownership: Ownership::Dispose,
                });
                matched = true;
                break;
            }

            if !matched {
                close_all(&layers);
                return Err(VdError::ParentNotFound {
                    path: cur_path,
                    tried: hints,
                });
            }
        }

        let chain = Self { layers };
        if let Err(err) = chain.validate() {
            close_all(&chain.layers);
            return Err(err);
        }
        Ok(chain)
    }

    /// Assemble a chain from already-opened images, child first, each with
    /// its own teardown tag. Verification covers the adjacent unique-id
    /// links and the self-containedness of the last image; nothing is
    /// closed on failure since the caller opened every handle.
    pub fn from_images(images: Vec<(Rc<RefCell<dyn ImageFile>>, Ownership)>) -> Result<Self> {
        if images.is_empty() {
            return Err(VdError::NotSupported("chain needs at least one image"));
        }
        for pair in images.windows(2) {
            let child = pair[0].0.borrow();
            let parent = pair[1].0.borrow();
            if !child.needs_parent() || child.parent_unique_id() != parent.unique_id() {
                return Err(VdError::ChainMismatch {
                    expected: child.parent_unique_id(),
                    found: parent.unique_id(),
                    path: parent.full_path(),
                });
            }
        }
        {
            let last = images.last().expect("non-empty").0.borrow();
            if last.needs_parent() {
                return Err(VdError::ParentNotFound {
                    path: last.full_path(),
                    tried: last.parent_location_hints(),
                });
            }
        }

        let chain = Self {
            layers: images
                .into_iter()
                .map(|(image, ownership)| ChainLayer { image, ownership })
                .collect(),
        };
        chain.validate()?;
        Ok(chain)
    }

    fn validate(&self) -> Result<()> {
        let capacity = self.capacity_bytes();
        for layer in &self.layers {
            if layer.image.borrow().capacity_bytes() != capacity {
                return Err(VdError::Corrupt("chain capacity mismatch"));
            }
        }
        Ok(())
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn layers(&self) -> &[ChainLayer] {
        &self.layers
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.layers[0].image.borrow().capacity_bytes()
    }

    /// Stack the layers into one sparse content stream. Writes (when the
    /// top image is writable) land in the top layer, promoting whole blocks
    /// from the ancestors first.
    pub fn content(&self) -> Result<LayeredStream> {
        let mut streams: Vec<Box<dyn SparseStream>> = Vec::with_capacity(self.layers.len());
        for (depth, layer) in self.layers.iter().enumerate() {
            streams.push(Box::new(ImageContentStream::new(layer.image(), depth == 0)));
        }
        let mut content = LayeredStream::new(streams)?;
        content.set_promote_granularity(self.layers[0].image.borrow().block_size() as u64)?;
        Ok(content)
    }

    /// Close every `Dispose`-tagged layer, deepest first. Idempotent.
    pub fn close(&mut self) {
        for layer in self.layers.iter().rev() {
            if layer.ownership == Ownership::Dispose {
                if let Ok(mut image) = layer.image.try_borrow_mut() {
                    image.close();
                }
            }
        }
    }
}

impl Drop for DiskChain {
    fn drop(&mut self) {
        self.close();
    }
}

fn close_all(layers: &[ChainLayer]) {
    for layer in layers.iter().rev() {
        layer.image.borrow_mut().close();
    }
}
