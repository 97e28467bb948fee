//! Keeps the render target's objects in line with the store.

use std::collections::{BTreeMap, HashSet};

use inkboard_core::{CanvasObject, ObjectId};

use crate::error::ApplyError;
use crate::render::RenderTarget;

/// Diff `objects` against what the target shows.
///
/// Missing objects are removed, new ones fully instantiated, existing ones
/// only moved/scaled. A failing object is reported and skipped; the rest
/// still reconcile.
pub fn reconcile_objects<R: RenderTarget + ?Sized>(
    objects: &BTreeMap<ObjectId, CanvasObject>,
    render: &mut R,
) -> Vec<ApplyError> {
    let shown: HashSet<ObjectId> = render.object_ids().into_iter().collect();
    let mut errors = Vec::new();

    let mut stale: Vec<&ObjectId> = shown.iter().filter(|id| !objects.contains_key(*id)).collect();
    stale.sort();
    for id in stale {
        render.remove_object(id);
    }

    for (id, object) in objects {
        let result = if shown.contains(id) {
            render.update_object(id, object.transform())
        } else {
            render.add_object(object)
        };
        if let Err(source) = result {
            let err = ApplyError::Object { id: id.clone(), source };
            log::error!("{err}");
            errors.push(err);
        }
    }

    errors
}
