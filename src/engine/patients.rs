use tracing::info;
use ulid::Ulid;

use super::{Engine, EngineError, Entity};
use crate::model::{Collection, NewPatient, Patient, PatientPatch};
use crate::store::{Filter, to_document};
use crate::validate;

fn by_sort_number(sort_number: i64) -> Filter {
    Filter::new().eq("sort_number", sort_number)
}

impl Engine {
    pub async fn create_patient(&self, fields: NewPatient) -> Result<Patient, EngineError> {
        validate::patient(&fields)?;

        let _keys = self.lock_patient_keys().await?;
        if self.patient_by_sort_number(fields.sort_number).await?.is_some() {
            return Err(EngineError::AlreadyExists(fields.sort_number));
        }

        let mut patient = Patient::new(Ulid::nil(), fields);
        patient.id = self
            .store
            .insert(Collection::Patients, to_document(&patient)?)
            .await?;
        info!(
            "patient {} created (sort_number {})",
            patient.id, patient.sort_number
        );
        Ok(patient)
    }

    /// All patients, or the ones with the given `sort_number`.
    pub async fn find_patients(&self, sort_number: Option<i64>) -> Result<Vec<Patient>, EngineError> {
        let filter = match sort_number {
            Some(n) => by_sort_number(n),
            None => Filter::new(),
        };
        self.find_all(Collection::Patients, &filter).await
    }

    pub async fn get_patient(&self, id: Ulid) -> Result<Patient, EngineError> {
        self.find(Collection::Patients, &Filter::by_id(id))
            .await?
            .ok_or_else(|| EngineError::not_found(Entity::Patient, id))
    }

    async fn patient_by_sort_number(&self, sort_number: i64) -> Result<Option<Patient>, EngineError> {
        self.find(Collection::Patients, &by_sort_number(sort_number))
            .await
    }

    /// Partial update of the patient keyed by `sort_number`. The merged
    /// record is validated before anything is written.
    pub async fn update_patient(
        &self,
        sort_number: i64,
        patch: PatientPatch,
    ) -> Result<Patient, EngineError> {
        let _keys = self.lock_patient_keys().await?;
        let current = self
            .patient_by_sort_number(sort_number)
            .await?
            .ok_or_else(|| EngineError::not_found(Entity::Patient, format!("sort_number {sort_number}")))?;

        let merged = patch.merged(&current);
        validate::patient(&merged)?;
        if merged.sort_number != current.sort_number
            && self
                .patient_by_sort_number(merged.sort_number)
                .await?
                .is_some()
        {
            return Err(EngineError::AlreadyExists(merged.sort_number));
        }

        let written = self
            .store
            .update_one(
                Collection::Patients,
                &Filter::by_id(current.id),
                to_document(&patch)?,
            )
            .await?;
        if written == 0 {
            return Err(EngineError::not_found(Entity::Patient, current.id));
        }
        Ok(Patient::new(current.id, merged))
    }

    pub async fn delete_patient(&self, sort_number: i64) -> Result<(), EngineError> {
        let _keys = self.lock_patient_keys().await?;
        let deleted = self
            .store
            .delete_one(Collection::Patients, &by_sort_number(sort_number))
            .await?;
        if deleted == 0 {
            return Err(EngineError::not_found(
                Entity::Patient,
                format!("sort_number {sort_number}"),
            ));
        }
        info!("patient with sort_number {sort_number} deleted");
        Ok(())
    }
}
