//! Descriptor database: map-point id -> descriptor for re-identification.

use std::collections::HashMap;

use nalgebra::Vector2;

use crate::map::MapPointId;

use super::Descriptor;

/// Descriptor stored for a map point, together with the pixel position it
/// was sampled at (in the creating keyframe's reference image). The
/// position anchors the SAD patch check during tracking.
#[derive(Debug, Clone)]
pub struct DescriptorEntry {
    pub descriptor: Descriptor,
    pub position: Vector2<f64>,
}

/// Index of map-point descriptors used to re-match predicted points against
/// current-frame features. Entries are added when a point is triangulated
/// and replaced if the point is re-described; `clear()` drops everything.
#[derive(Debug, Default)]
pub struct DescriptorDatabase {
    entries: HashMap<MapPointId, DescriptorEntry>,
}

impl DescriptorDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the descriptor for a map point.
    pub fn add(&mut self, id: MapPointId, descriptor: Descriptor, position: Vector2<f64>) {
        self.entries.insert(
            id,
            DescriptorEntry {
                descriptor,
                position,
            },
        );
    }

    pub fn get(&self, id: MapPointId) -> Option<&DescriptorEntry> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_get_clear() {
        let mut db = DescriptorDatabase::new();
        assert!(db.is_empty());

        let id = MapPointId::new(7);
        db.add(id, Descriptor([1; 32]), Vector2::new(10.0, 20.0));
        assert_eq!(db.len(), 1);

        let entry = db.get(id).unwrap();
        assert_eq!(entry.descriptor, Descriptor([1; 32]));
        assert_eq!(entry.position, Vector2::new(10.0, 20.0));

        // Re-adding replaces.
        db.add(id, Descriptor([2; 32]), Vector2::new(11.0, 21.0));
        assert_eq!(db.len(), 1);
        assert_eq!(db.get(id).unwrap().descriptor, Descriptor([2; 32]));

        db.clear();
        assert!(db.get(id).is_none());
        assert!(db.is_empty());
    }
}
