use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use crate::models::ProviderSettings;
use crate::notify::{Broadcaster, ModelStateSnapshot, Notification};
use crate::providers::{
    catalog, provider_by_id, provider_for_model, validate_api_key, validation_error, ModelKind,
    ProviderInfo, LOCAL_API_KEY,
};
use crate::repository::{ProviderSettingsRepository, StoreContext};

/// Rejection raised by `set_selected_model` for models outside the set of
/// currently available ones.
#[derive(Debug)]
pub struct ModelNotAvailable {
    pub kind: ModelKind,
    pub model_id: String,
}

impl std::fmt::Display for ModelNotAvailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "model {} is not available for type {}",
            self.model_id,
            self.kind.as_str()
        )
    }
}

impl std::error::Error for ModelNotAvailable {}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SelectedModels {
    pub llm: Option<String>,
    pub stt: Option<String>,
}

impl SelectedModels {
    fn get(&self, kind: ModelKind) -> Option<&str> {
        match kind {
            ModelKind::Llm => self.llm.as_deref(),
            ModelKind::Stt => self.stt.as_deref(),
        }
    }

    fn set(&mut self, kind: ModelKind, value: Option<String>) {
        match kind {
            ModelKind::Llm => self.llm = value,
            ModelKind::Stt => self.stt = value,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AvailableModel {
    pub id: String,
    pub name: String,
    pub provider: String,
}

#[derive(Clone, Debug)]
pub struct CurrentModelInfo {
    pub provider: String,
    pub model: String,
    pub api_key: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct ModelState {
    api_keys: BTreeMap<String, Option<String>>,
    selected: SelectedModels,
}

fn empty_api_keys() -> BTreeMap<String, Option<String>> {
    catalog().iter().map(|p| (p.id.to_string(), None)).collect()
}

fn has_usable_key(state: &ModelState, provider: &ProviderInfo) -> bool {
    let Some(Some(key)) = state.api_keys.get(provider.id) else {
        return false;
    };
    if provider.is_local {
        key == LOCAL_API_KEY
    } else {
        !key.trim().is_empty()
    }
}

/// Union of the models offered by every provider holding a usable
/// credential, deduplicated by model id with the first occurrence winning.
/// Providers enumerate in lexicographic id order (the documented tie-break).
fn available_models(state: &ModelState, kind: ModelKind) -> Vec<AvailableModel> {
    let mut out: Vec<AvailableModel> = Vec::new();
    for provider in catalog() {
        if !has_usable_key(state, provider) {
            continue;
        }
        for model in provider.models(kind) {
            if out.iter().any(|m| m.id == model.id) {
                continue;
            }
            out.push(AvailableModel {
                id: model.id.to_string(),
                name: model.name.to_string(),
                provider: provider.id.to_string(),
            });
        }
    }
    out
}

/// Resolves the provider owning a model id. Unknown LLM ids fall back to
/// Ollama when it is configured, to accommodate user-pulled local models.
fn provider_for_model_in(
    state: &ModelState,
    kind: ModelKind,
    model_id: &str,
) -> Option<&'static ProviderInfo> {
    if let Some(provider) = provider_for_model(kind, model_id) {
        return Some(provider);
    }

    if kind == ModelKind::Llm {
        if let Some(ollama) = provider_by_id("ollama") {
            if has_usable_key(state, ollama) {
                return Some(ollama);
            }
        }
    }

    None
}

/// Auto-selection: for each type the current selection is kept iff it is
/// still available and its provider holds a usable credential (and the type
/// is not being forced). Otherwise the first API-backed model wins, then the
/// first local one, then the selection is cleared. Pure over its inputs.
fn auto_select(state: &mut ModelState, force: &[ModelKind]) -> Vec<(ModelKind, Option<String>)> {
    let mut changes = Vec::new();

    for kind in ModelKind::ALL {
        let forced = force.contains(&kind);
        let current = state.selected.get(kind).map(|m| m.to_string());

        let current_valid = !forced
            && current.as_deref().is_some_and(|model_id| {
                provider_for_model_in(state, kind, model_id)
                    .is_some_and(|provider| has_usable_key(state, provider))
            });
        if current_valid {
            continue;
        }

        let available = available_models(state, kind);
        let pick = available
            .iter()
            .find(|m| {
                provider_by_id(&m.provider).is_some_and(|p| !p.is_local)
            })
            .or_else(|| available.first())
            .map(|m| m.id.clone());

        if pick != current {
            state.selected.set(kind, pick.clone());
            changes.push((kind, pick));
        }
    }

    changes
}

/// Tracks configured provider credentials and the selected LLM/STT models,
/// persisting through the repository layer so the state always lives on the
/// currently active backend.
pub struct ModelStateService {
    settings: ProviderSettingsRepository,
    notifier: Arc<Broadcaster>,
    state: Mutex<ModelState>,
}

impl ModelStateService {
    pub fn new(ctx: Arc<StoreContext>, notifier: Arc<Broadcaster>) -> Self {
        Self {
            settings: ProviderSettingsRepository::new(ctx),
            notifier,
            state: Mutex::new(ModelState {
                api_keys: empty_api_keys(),
                selected: SelectedModels::default(),
            }),
        }
    }

    fn snapshot(state: &ModelState) -> ModelStateSnapshot {
        ModelStateSnapshot {
            api_keys: state.api_keys.clone(),
            selected_llm: state.selected.llm.clone(),
            selected_stt: state.selected.stt.clone(),
        }
    }

    fn state_from_rows(rows: &[ProviderSettings]) -> ModelState {
        let mut api_keys = empty_api_keys();
        for row in rows {
            if api_keys.contains_key(&row.provider) {
                if let Some(key) = &row.api_key {
                    api_keys.insert(row.provider.clone(), Some(key.clone()));
                }
            }
        }

        let mut selected = SelectedModels::default();
        for kind in ModelKind::ALL {
            let winner = rows
                .iter()
                .filter_map(|row| {
                    let model = match kind {
                        ModelKind::Llm => row.selected_llm_model.as_ref(),
                        ModelKind::Stt => row.selected_stt_model.as_ref(),
                    };
                    model.map(|m| (row.updated_at_ms, m.clone()))
                })
                .max_by_key(|(updated_at, _)| *updated_at)
                .map(|(_, model)| model);
            selected.set(kind, winner);
        }

        ModelState { api_keys, selected }
    }

    /// Auto-selection output is derived state; persistence failures are
    /// logged, not surfaced, and repaired on the next reload.
    fn persist_changes(&self, state: &ModelState, changes: &[(ModelKind, Option<String>)]) {
        for (kind, pick) in changes {
            let result = match pick {
                Some(model_id) => match provider_for_model_in(state, *kind, model_id) {
                    Some(provider) => {
                        self.settings.set_selected_model(*kind, provider.id, model_id)
                    }
                    None => Ok(()),
                },
                None => self.settings.clear_selected_model(*kind),
            };
            if let Err(e) = result {
                log::warn!(
                    "failed to persist {} selection: {e:#}",
                    kind.as_str()
                );
            }
        }
    }

    /// Reloads credentials and selections from the currently active backend.
    /// Called on every auth-state change.
    pub fn reload(&self) -> Result<()> {
        let rows = self.settings.all()?;
        let mut loaded = Self::state_from_rows(&rows);
        let changes = auto_select(&mut loaded, &[]);
        self.persist_changes(&loaded, &changes);

        if !changes.is_empty() {
            log::info!(
                "auto-selected models on reload: llm={:?} stt={:?}",
                loaded.selected.llm,
                loaded.selected.stt
            );
        }

        let mut state = self.state.lock().map_err(|_| anyhow!("poisoned lock"))?;
        *state = loaded;
        Ok(())
    }

    pub fn set_api_key(&self, provider_id: &str, key: &str) -> Result<()> {
        let provider = provider_by_id(provider_id)
            .ok_or_else(|| validation_error(format!("unknown provider: {provider_id}")))?;
        validate_api_key(provider, key)?;

        let stored = if provider.is_local { LOCAL_API_KEY } else { key };
        self.settings.upsert_api_key(provider_id, Some(stored))?;

        let snapshot = {
            let mut state = self.state.lock().map_err(|_| anyhow!("poisoned lock"))?;
            state
                .api_keys
                .insert(provider_id.to_string(), Some(stored.to_string()));
            let changes = auto_select(&mut state, &[]);
            self.persist_changes(&state, &changes);
            Self::snapshot(&state)
        };

        self.notifier
            .emit(&Notification::ModelStateUpdated(snapshot));
        self.notifier.emit(&Notification::SettingsUpdated);
        Ok(())
    }

    pub fn get_api_key(&self, provider_id: &str) -> Option<String> {
        let state = self.state.lock().ok()?;
        state.api_keys.get(provider_id).cloned().flatten()
    }

    pub fn get_all_api_keys(&self) -> BTreeMap<String, Option<String>> {
        self.state
            .lock()
            .map(|state| state.api_keys.clone())
            .unwrap_or_default()
    }

    /// Returns `false` when no key was configured for the provider.
    pub fn remove_api_key(&self, provider_id: &str) -> Result<bool> {
        if provider_by_id(provider_id).is_none() {
            return Err(validation_error(format!("unknown provider: {provider_id}")));
        }

        let had_key = {
            let state = self.state.lock().map_err(|_| anyhow!("poisoned lock"))?;
            state
                .api_keys
                .get(provider_id)
                .map(|k| k.is_some())
                .unwrap_or(false)
        };
        if !had_key {
            return Ok(false);
        }

        self.settings.remove(provider_id)?;

        let (snapshot, both_cleared) = {
            let mut state = self.state.lock().map_err(|_| anyhow!("poisoned lock"))?;

            // A removed provider that backed the current selection forces
            // re-selection for that type, even if other credentials exist.
            let mut force = Vec::new();
            for kind in ModelKind::ALL {
                let backing = state
                    .selected
                    .get(kind)
                    .and_then(|model_id| provider_for_model_in(&state, kind, model_id));
                if backing.map(|p| p.id) == Some(provider_id) {
                    force.push(kind);
                }
            }

            state.api_keys.insert(provider_id.to_string(), None);
            let changes = auto_select(&mut state, &force);
            self.persist_changes(&state, &changes);

            let both_cleared = state.selected.llm.is_none() && state.selected.stt.is_none();
            (Self::snapshot(&state), both_cleared)
        };

        self.notifier
            .emit(&Notification::ModelStateUpdated(snapshot));
        self.notifier.emit(&Notification::SettingsUpdated);
        if both_cleared {
            self.notifier.emit(&Notification::ForceShowApiKeyHeader);
        }
        Ok(true)
    }

    pub fn get_available_models(&self, kind: ModelKind) -> Vec<AvailableModel> {
        self.state
            .lock()
            .map(|state| available_models(&state, kind))
            .unwrap_or_default()
    }

    pub fn get_selected_models(&self) -> SelectedModels {
        self.state
            .lock()
            .map(|state| state.selected.clone())
            .unwrap_or_default()
    }

    pub fn set_selected_model(&self, kind: ModelKind, model_id: &str) -> Result<()> {
        let snapshot = {
            let mut state = self.state.lock().map_err(|_| anyhow!("poisoned lock"))?;

            let available = available_models(&state, kind);
            if !available.iter().any(|m| m.id == model_id) {
                return Err(ModelNotAvailable {
                    kind,
                    model_id: model_id.to_string(),
                }
                .into());
            }

            let provider = provider_for_model_in(&state, kind, model_id)
                .ok_or_else(|| validation_error(format!("no provider offers {model_id}")))?;

            // Persist before mutating so a storage failure leaves the prior
            // selection fully intact.
            self.settings
                .set_selected_model(kind, provider.id, model_id)?;

            state.selected.set(kind, Some(model_id.to_string()));
            Self::snapshot(&state)
        };

        self.notifier
            .emit(&Notification::ModelStateUpdated(snapshot));
        self.notifier.emit(&Notification::SettingsUpdated);
        Ok(())
    }

    pub fn provider_for_selected(&self, kind: ModelKind) -> Option<String> {
        let state = self.state.lock().ok()?;
        let model_id = state.selected.get(kind)?;
        provider_for_model_in(&state, kind, model_id).map(|p| p.id.to_string())
    }

    /// Everything a downstream consumer needs to call the selected model.
    pub fn current_model_info(&self, kind: ModelKind) -> Option<CurrentModelInfo> {
        let state = self.state.lock().ok()?;
        let model_id = state.selected.get(kind)?;
        let provider = provider_for_model_in(&state, kind, model_id)?;
        let api_key = state.api_keys.get(provider.id).cloned().flatten();
        Some(CurrentModelInfo {
            provider: provider.id.to_string(),
            model: model_id.to_string(),
            api_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_keys(keys: &[(&str, &str)]) -> ModelState {
        let mut state = ModelState {
            api_keys: empty_api_keys(),
            selected: SelectedModels::default(),
        };
        for (provider, key) in keys {
            state
                .api_keys
                .insert(provider.to_string(), Some(key.to_string()));
        }
        state
    }

    #[test]
    fn no_credentials_means_no_available_models() {
        let state = state_with_keys(&[]);
        assert!(available_models(&state, ModelKind::Llm).is_empty());
        assert!(available_models(&state, ModelKind::Stt).is_empty());
    }

    #[test]
    fn auto_select_prefers_api_over_local_provider() {
        let mut state = state_with_keys(&[("ollama", "local"), ("openai", "sk-test")]);
        auto_select(&mut state, &[]);
        // anthropic < ollama < openai lexicographically, but only API-backed
        // providers win the first pass.
        assert_eq!(state.selected.llm.as_deref(), Some("gpt-4.1"));
    }

    #[test]
    fn auto_select_falls_back_to_local_provider() {
        let mut state = state_with_keys(&[("ollama", "local")]);
        auto_select(&mut state, &[]);
        assert_eq!(state.selected.llm.as_deref(), Some("llama3.2:latest"));
        assert_eq!(state.selected.stt, None);
    }

    #[test]
    fn auto_select_clears_selection_when_nothing_is_available() {
        let mut state = state_with_keys(&[]);
        state.selected.llm = Some("gpt-4.1".to_string());
        auto_select(&mut state, &[]);
        assert_eq!(state.selected.llm, None);
    }

    #[test]
    fn auto_select_keeps_a_valid_selection() {
        let mut state = state_with_keys(&[("gemini", "key"), ("openai", "sk-test")]);
        state.selected.llm = Some("gemini-2.5-pro".to_string());
        auto_select(&mut state, &[]);
        assert_eq!(state.selected.llm.as_deref(), Some("gemini-2.5-pro"));
    }

    #[test]
    fn forced_reselection_ignores_the_current_selection() {
        let mut state = state_with_keys(&[("gemini", "key"), ("openai", "sk-test")]);
        state.selected.llm = Some("gemini-2.5-pro".to_string());
        auto_select(&mut state, &[ModelKind::Llm]);
        // Lexicographic provider order makes gemini the stable winner.
        assert_eq!(state.selected.llm.as_deref(), Some("gemini-2.5-flash"));
    }

    #[test]
    fn auto_select_is_deterministic() {
        let build = || {
            let mut state = state_with_keys(&[("anthropic", "sk-ant-k"), ("openai", "sk-test")]);
            state.selected.llm = Some("gone-model".to_string());
            state
        };

        let mut a = build();
        let mut b = build();
        auto_select(&mut a, &[]);
        auto_select(&mut b, &[]);
        assert_eq!(a, b);
        assert_eq!(a.selected.llm.as_deref(), Some("claude-sonnet-4"));
    }

    #[test]
    fn available_models_dedup_first_occurrence_wins() {
        let state = state_with_keys(&[("gemini", "key"), ("openai", "sk-test")]);
        let models = available_models(&state, ModelKind::Llm);
        let ids: Vec<&str> = models.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(
            ids,
            ["gemini-2.5-flash", "gemini-2.5-pro", "gpt-4.1", "gpt-4o-mini"]
        );
    }

    #[test]
    fn unknown_llm_model_maps_to_configured_ollama() {
        let state = state_with_keys(&[("ollama", "local")]);
        let provider = provider_for_model_in(&state, ModelKind::Llm, "custom-model:3b");
        assert_eq!(provider.map(|p| p.id), Some("ollama"));

        let none = provider_for_model_in(&state_with_keys(&[]), ModelKind::Llm, "custom-model:3b");
        assert!(none.is_none());
    }
}
