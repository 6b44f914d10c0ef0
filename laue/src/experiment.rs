//! Top-level registry owning data sets, cells, and peak collections.

use crate::collection::PeakCollection;
use crate::dataset::DataSet;
use crate::error::{Error, Result};
use crate::unit_cell::UnitCell;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Name-keyed owner of the long-lived pipeline objects.
///
/// Data sets and unit cells are owned here and only here; peaks refer to
/// cells through weak references, so dropping a cell from the registry is
/// observable (promotion fails) rather than a dangling use.
#[derive(Default)]
pub struct Experiment {
    name: String,
    data_sets: BTreeMap<String, Arc<DataSet>>,
    unit_cells: BTreeMap<String, Arc<RwLock<UnitCell>>>,
    peak_collections: BTreeMap<String, PeakCollection>,
}

impl Experiment {
    /// Empty experiment.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Experiment name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a data set under its own name.
    ///
    /// # Errors
    ///
    /// [`Error::Domain`] when the name is taken.
    pub fn add_data_set(&mut self, data: DataSet) -> Result<Arc<DataSet>> {
        let name = data.name().to_string();
        if self.data_sets.contains_key(&name) {
            return Err(Error::Domain(format!("data set '{name}' already registered")));
        }
        let data = Arc::new(data);
        self.data_sets.insert(name.clone(), Arc::clone(&data));
        info!(name, "data set registered");
        Ok(data)
    }

    /// Look up a data set.
    #[must_use]
    pub fn data_set(&self, name: &str) -> Option<Arc<DataSet>> {
        self.data_sets.get(name).cloned()
    }

    /// All data set names.
    #[must_use]
    pub fn data_set_names(&self) -> Vec<&str> {
        self.data_sets.keys().map(String::as_str).collect()
    }

    /// Register a unit cell under a name.
    ///
    /// # Errors
    ///
    /// [`Error::Domain`] when the name is taken.
    pub fn add_unit_cell(
        &mut self,
        name: impl Into<String>,
        mut cell: UnitCell,
    ) -> Result<Arc<RwLock<UnitCell>>> {
        let name = name.into();
        if self.unit_cells.contains_key(&name) {
            return Err(Error::Domain(format!("unit cell '{name}' already registered")));
        }
        cell.set_name(name.clone());
        let cell = Arc::new(RwLock::new(cell));
        self.unit_cells.insert(name.clone(), Arc::clone(&cell));
        info!(name, "unit cell registered");
        Ok(cell)
    }

    /// Look up a unit cell.
    #[must_use]
    pub fn unit_cell(&self, name: &str) -> Option<Arc<RwLock<UnitCell>>> {
        self.unit_cells.get(name).cloned()
    }

    /// Remove a unit cell; peaks still holding the weak reference will
    /// observe the loss on promotion.
    pub fn remove_unit_cell(&mut self, name: &str) -> Option<Arc<RwLock<UnitCell>>> {
        self.unit_cells.remove(name)
    }

    /// Register a peak collection under its own name.
    ///
    /// # Errors
    ///
    /// [`Error::Domain`] when the name is taken.
    pub fn add_peak_collection(&mut self, collection: PeakCollection) -> Result<()> {
        let name = collection.name().to_string();
        if self.peak_collections.contains_key(&name) {
            return Err(Error::Domain(format!(
                "peak collection '{name}' already registered"
            )));
        }
        self.peak_collections.insert(name, collection);
        Ok(())
    }

    /// Look up a peak collection.
    #[must_use]
    pub fn peak_collection(&self, name: &str) -> Option<&PeakCollection> {
        self.peak_collections.get(name)
    }

    /// Mutable look-up of a peak collection.
    pub fn peak_collection_mut(&mut self, name: &str) -> Option<&mut PeakCollection> {
        self.peak_collections.get_mut(name)
    }

    /// Remove a peak collection.
    pub fn remove_peak_collection(&mut self, name: &str) -> Option<PeakCollection> {
        self.peak_collections.remove(name)
    }

    /// All peak collection names.
    #[must_use]
    pub fn peak_collection_names(&self) -> Vec<&str> {
        self.peak_collections.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::PeakCollectionKind;
    use crate::ellipsoid::Ellipsoid;
    use crate::instrument::{Detector, InstrumentState};
    use crate::peak::Peak;
    use nalgebra::{UnitQuaternion, Vector3};
    use ndarray::Array2;

    fn test_data_set(name: &str) -> DataSet {
        let detector = Detector::new(32, 32, 1.0, 1.0, 150.0);
        let frames = vec![Array2::zeros((32, 32)); 4];
        let states = vec![InstrumentState::new(UnitQuaternion::identity(), 1.0); 4];
        DataSet::new(name, detector, frames, states).unwrap()
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut experiment = Experiment::new("test");
        experiment.add_data_set(test_data_set("scan1")).unwrap();
        assert!(experiment.add_data_set(test_data_set("scan1")).is_err());
        assert_eq!(experiment.data_set_names(), vec!["scan1"]);
    }

    #[test]
    fn dropping_a_cell_invalidates_peak_references() {
        let mut experiment = Experiment::new("test");
        let data = experiment.add_data_set(test_data_set("scan")).unwrap();
        let cell = experiment
            .add_unit_cell(
                "primary",
                UnitCell::from_parameters(5.0, 6.0, 7.0, 1.5708, 1.5708, 1.5708).unwrap(),
            )
            .unwrap();

        let mut peak = Peak::new(
            Arc::clone(&data),
            Ellipsoid::sphere(Vector3::new(10.0, 10.0, 1.0), 1.5),
        );
        peak.set_unit_cell(&cell);
        drop(cell);
        assert!(peak.unit_cell().is_some());

        experiment.remove_unit_cell("primary");
        assert!(peak.unit_cell().is_none());
    }

    #[test]
    fn collections_are_owned_by_name() {
        let mut experiment = Experiment::new("test");
        let collection = PeakCollection::new("found", PeakCollectionKind::Found);
        experiment.add_peak_collection(collection).unwrap();
        assert!(experiment.peak_collection("found").is_some());
        assert!(experiment.remove_peak_collection("found").is_some());
        assert!(experiment.peak_collection("found").is_none());
    }
}
