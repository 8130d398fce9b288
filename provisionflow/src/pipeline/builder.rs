//! Pipeline builder with validation.

use std::collections::HashMap;
use std::sync::Arc;

use super::Pipeline;
use crate::errors::{ContractErrorInfo, PipelineValidationError};
use crate::stages::Stage;

/// Builder for creating validated pipelines.
#[derive(Clone)]
pub struct PipelineBuilder {
    /// The pipeline name.
    name: String,
    /// The stages, in insertion order.
    stages: Vec<Arc<dyn Stage>>,
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("name", &self.name)
            .field("stages", &self.stages.len())
            .finish()
    }
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    /// Adds a stage to the end of the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty, already used, or the stage
    /// depends on itself.
    pub fn add(self, stage: impl Stage + 'static) -> Result<Self, PipelineValidationError> {
        self.stage(Arc::new(stage))
    }

    /// Adds a shared stage to the end of the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty, already used, or the stage
    /// depends on itself.
    pub fn stage(mut self, stage: Arc<dyn Stage>) -> Result<Self, PipelineValidationError> {
        self.add_stage(stage)?;
        Ok(self)
    }

    /// Adds a stage in place.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn add_stage(&mut self, stage: Arc<dyn Stage>) -> Result<(), PipelineValidationError> {
        let name = stage.name().to_string();

        if name.trim().is_empty() {
            return Err(PipelineValidationError::new("Stage name cannot be empty")
                .with_error_info(
                    ContractErrorInfo::new("CONTRACT-004-EMPTY_NAME", "Stage has an empty name")
                        .with_fix_hint("Give every stage a unique, non-empty name."),
                ));
        }

        if self.stages.iter().any(|s| s.name() == name) {
            return Err(PipelineValidationError::new(format!(
                "Stage '{name}' is defined more than once"
            ))
            .with_stages(vec![name.clone()])
            .with_error_info(
                ContractErrorInfo::new(
                    "CONTRACT-004-DUPLICATE",
                    format!("Stage '{name}' already exists in pipeline '{}'", self.name),
                )
                .with_fix_hint("Stage names must be unique within a pipeline."),
            ));
        }

        if stage.depends_on().iter().any(|d| *d == name) {
            return Err(PipelineValidationError::new(format!(
                "Stage '{name}' cannot depend on itself"
            ))
            .with_stages(vec![name])
            .with_error_info(ContractErrorInfo::new(
                "CONTRACT-004-SELF_DEP",
                "A stage cannot depend on itself",
            )));
        }

        self.stages.push(stage);
        Ok(())
    }

    /// Appends every stage of another builder.
    ///
    /// # Errors
    ///
    /// Returns an error if a stage name is already used.
    pub fn extend(mut self, other: Self) -> Result<Self, PipelineValidationError> {
        for stage in other.stages {
            self.add_stage(stage)?;
        }
        Ok(self)
    }

    /// Builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the builder has no stages, or a dependency names a
    /// stage that is unknown or comes later in the pipeline.
    pub fn build(self) -> Result<Pipeline, PipelineValidationError> {
        if self.stages.is_empty() {
            return Err(PipelineValidationError::new("Pipeline has no stages")
                .with_error_info(
                    ContractErrorInfo::new("CONTRACT-004-EMPTY", "Cannot build an empty pipeline")
                        .with_fix_hint("Add at least one stage to the pipeline before building."),
                ));
        }

        let positions: HashMap<&str, usize> = self
            .stages
            .iter()
            .enumerate()
            .map(|(index, stage)| (stage.name(), index))
            .collect();

        for (index, stage) in self.stages.iter().enumerate() {
            for dep in stage.depends_on() {
                match positions.get(dep.as_str()) {
                    None => {
                        return Err(PipelineValidationError::new(format!(
                            "Stage '{}' depends on unknown stage '{dep}'",
                            stage.name()
                        ))
                        .with_stages(vec![stage.name().to_string(), dep.clone()])
                        .with_error_info(
                            ContractErrorInfo::new(
                                "CONTRACT-004-MISSING_DEP",
                                format!("Dependency '{dep}' not found"),
                            )
                            .with_fix_hint(
                                "Ensure the dependency is added before the stage that depends on it.",
                            ),
                        ));
                    }
                    Some(position) if *position > index => {
                        return Err(PipelineValidationError::new(format!(
                            "Stage '{}' depends on later stage '{dep}'",
                            stage.name()
                        ))
                        .with_stages(vec![stage.name().to_string(), dep.clone()])
                        .with_error_info(
                            ContractErrorInfo::new(
                                "CONTRACT-004-ORDER",
                                format!("Dependency '{dep}' runs after '{}'", stage.name()),
                            )
                            .with_context_entry("stage_index", index.to_string())
                            .with_context_entry("dependency_index", position.to_string())
                            .with_fix_hint("Move the dependency earlier in the pipeline."),
                        ));
                    }
                    Some(_) => {}
                }
            }
        }

        Ok(Pipeline::new(self.name, self.stages))
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CallLog, ScriptedStage};

    fn scripted(name: &str) -> ScriptedStage {
        ScriptedStage::new(name, CallLog::new())
    }

    fn code(err: PipelineValidationError) -> String {
        err.error_info.unwrap().code
    }

    #[test]
    fn test_builder_creation() {
        let builder = PipelineBuilder::new("test");
        assert_eq!(builder.name(), "test");
        assert_eq!(builder.stage_count(), 0);
    }

    #[test]
    fn test_builder_with_dependencies() {
        let builder = PipelineBuilder::new("test")
            .add(scripted("stage1"))
            .unwrap()
            .add(scripted("stage2").after(["stage1"]))
            .unwrap();

        assert_eq!(builder.stage_count(), 2);
    }

    #[test]
    fn test_builder_duplicate_name() {
        let err = PipelineBuilder::new("test")
            .add(scripted("stage1"))
            .unwrap()
            .add(scripted("stage1"))
            .unwrap_err();
        assert_eq!(err.stages, vec!["stage1"]);
        assert_eq!(code(err), "CONTRACT-004-DUPLICATE");
    }

    #[test]
    fn test_builder_self_dependency() {
        let err = PipelineBuilder::new("test")
            .add(scripted("stage1").after(["stage1"]))
            .unwrap_err();
        assert_eq!(code(err), "CONTRACT-004-SELF_DEP");
    }

    #[test]
    fn test_builder_missing_dependency() {
        let err = PipelineBuilder::new("test")
            .add(scripted("stage1").after(["missing"]))
            .unwrap()
            .build()
            .unwrap_err();
        assert_eq!(err.stages, vec!["stage1", "missing"]);
        assert_eq!(code(err), "CONTRACT-004-MISSING_DEP");
    }

    #[test]
    fn test_builder_rejects_dependency_on_later_stage() {
        let err = PipelineBuilder::new("test")
            .add(scripted("release").after(["namespace"]))
            .unwrap()
            .add(scripted("namespace"))
            .unwrap()
            .build()
            .unwrap_err();
        let info = err.error_info.unwrap();
        assert_eq!(info.code, "CONTRACT-004-ORDER");
        assert!(info.fix_hint.is_some());
    }

    #[test]
    fn test_builder_empty_build() {
        let err = PipelineBuilder::new("test").build().unwrap_err();
        assert_eq!(code(err), "CONTRACT-004-EMPTY");
    }

    #[test]
    fn test_builder_extend() {
        let first = PipelineBuilder::new("a").add(scripted("stage1")).unwrap();
        let second = PipelineBuilder::new("b")
            .add(scripted("stage2").after(["stage1"]))
            .unwrap();

        let pipeline = first.extend(second).unwrap().build().unwrap();
        assert_eq!(pipeline.name(), "a");
        assert_eq!(pipeline.stage_names(), vec!["stage1", "stage2"]);

        let clash = PipelineBuilder::new("c").add(scripted("stage1")).unwrap();
        let again = PipelineBuilder::new("a").add(scripted("stage1")).unwrap();
        assert!(again.extend(clash).is_err());
    }
}
