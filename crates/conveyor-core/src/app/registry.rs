//! IntegrationRegistry - ステージ → 連携実装の対応表
//!
//! 起動時に組み立てて、以後は読み取り専用。
//! ステージは閉じた 5 種類なので配列で持ち、完成した registry は
//! 「全ステージに必ず実装がある」ことを型で保証します（`get` は失敗しない）。

use std::sync::Arc;

use crate::domain::PipelineStage;
use crate::error::ConveyorError;
use crate::ports::StageIntegration;

const STAGES: usize = PipelineStage::ALL.len();

/// Mutable during startup.
#[derive(Default)]
pub struct IntegrationRegistryBuilder {
    slots: [Option<Arc<dyn StageIntegration>>; STAGES],
}

impl IntegrationRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `stage`. A stage can be bound once.
    pub fn register(
        &mut self,
        stage: PipelineStage,
        integration: Arc<dyn StageIntegration>,
    ) -> Result<(), ConveyorError> {
        let slot = &mut self.slots[stage.index()];
        if slot.is_some() {
            return Err(ConveyorError::DuplicateIntegration(stage));
        }
        *slot = Some(integration);
        Ok(())
    }

    pub fn missing(&self) -> Vec<PipelineStage> {
        PipelineStage::ALL
            .into_iter()
            .filter(|stage| self.slots[stage.index()].is_none())
            .collect()
    }

    /// Fails with `MissingIntegrations` unless every stage is bound.
    pub fn build(self) -> Result<IntegrationRegistry, ConveyorError> {
        let missing = self.missing();
        if !missing.is_empty() {
            return Err(ConveyorError::MissingIntegrations(missing));
        }
        let bound: Vec<Arc<dyn StageIntegration>> = self.slots.into_iter().flatten().collect();
        let bound = bound
            .try_into()
            .map_err(|_| ConveyorError::MissingIntegrations(Vec::new()))?;
        Ok(IntegrationRegistry { bound })
    }
}

/// Complete, immutable stage → integration table.
pub struct IntegrationRegistry {
    bound: [Arc<dyn StageIntegration>; STAGES],
}

impl IntegrationRegistry {
    pub fn builder() -> IntegrationRegistryBuilder {
        IntegrationRegistryBuilder::new()
    }

    pub fn get(&self, stage: PipelineStage) -> &Arc<dyn StageIntegration> {
        &self.bound[stage.index()]
    }
}
