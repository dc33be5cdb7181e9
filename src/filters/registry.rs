//! Operator registry for building nodes by name.

use crate::core::border::BorderPolicy;
use crate::core::error::{TileError, TileResult};
use crate::core::types::Rectangle;
use crate::graph::environment::Environment;
use crate::graph::node::ImageNode;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Factory function building a node over `sources` from named parameters.
pub type OperatorFactory =
    Arc<dyn Fn(&Environment, &[Arc<ImageNode>], &OperatorParams) -> TileResult<Arc<ImageNode>> + Send + Sync>;

/// Broad family an operator belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Window filters computed tile by tile.
    Area,
    /// Global transforms over the whole image.
    Untiled,
    /// Measurements over a region of interest.
    Statistics,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Area => "area",
            Category::Untiled => "untiled",
            Category::Statistics => "statistics",
        };
        f.write_str(name)
    }
}

/// Descriptive data about a registered operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: Category,
    /// Parameter names with a short explanation each.
    pub parameters: Vec<(String, String)>,
}

impl OperatorInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>, category: Category) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            category,
            parameters: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn parameter(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.parameters.push((name.into(), description.into()));
        self
    }
}

/// Named operator parameters.
///
/// Values are JSON so that parameters read from the command line, from
/// files and from code all look the same.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperatorParams(IndexMap<String, Value>);

impl OperatorParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `key=value,key=value`. Values are read as JSON where possible
    /// and kept as strings otherwise.
    pub fn parse(text: &str) -> TileResult<Self> {
        let mut params = Self::new();
        for pair in split_pairs(text) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| TileError::invalid_argument(format!("expected key=value, got '{pair}'")))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(TileError::invalid_argument(format!("empty parameter name in '{pair}'")));
            }
            let value = value.trim();
            let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
            params.0.insert(key.to_string(), value);
        }
        Ok(params)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Integer parameter, or `default` when absent.
    pub fn get_i64(&self, key: &str, default: i64) -> TileResult<i64> {
        match self.0.get(key) {
            None => Ok(default),
            Some(value) => value
                .as_i64()
                .ok_or_else(|| TileError::invalid_argument(format!("parameter '{key}' must be an integer, got {value}"))),
        }
    }

    /// Integer parameter that must fit an `i32` and be at least `min`.
    pub fn get_i32_at_least(&self, key: &str, default: i32, min: i32) -> TileResult<i32> {
        let value = self.get_i64(key, default as i64)?;
        i32::try_from(value)
            .ok()
            .filter(|v| *v >= min)
            .ok_or_else(|| TileError::invalid_argument(format!("parameter '{key}' must be at least {min}, got {value}")))
    }

    /// Float parameter, or `default` when absent. Integers are accepted.
    pub fn get_f64(&self, key: &str, default: f64) -> TileResult<f64> {
        match self.0.get(key) {
            None => Ok(default),
            Some(value) => value
                .as_f64()
                .ok_or_else(|| TileError::invalid_argument(format!("parameter '{key}' must be a number, got {value}"))),
        }
    }

    /// String parameter, if present.
    pub fn get_str(&self, key: &str) -> TileResult<Option<&str>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(value) => Err(TileError::invalid_argument(format!("parameter '{key}' must be a string, got {value}"))),
        }
    }

    /// Optional `border` parameter: `zero`, `copy`, `reflect` or
    /// `constant:<v>[,<v>...]`.
    pub fn border(&self) -> TileResult<Option<BorderPolicy>> {
        match self.0.get("border") {
            None => Ok(None),
            Some(Value::String(s)) => s.parse().map(Some),
            Some(Value::Number(n)) => n
                .as_f64()
                .map(|v| Some(BorderPolicy::Constant(vec![v])))
                .ok_or_else(|| TileError::invalid_argument(format!("invalid border constant {n}"))),
            Some(value) => Err(TileError::invalid_argument(format!("invalid border {value}"))),
        }
    }

    /// Rectangle parameter given as `"x,y,w,h"` or `[x, y, w, h]`.
    pub fn get_rect(&self, key: &str) -> TileResult<Option<Rectangle>> {
        let numbers: Vec<i64> = match self.0.get(key) {
            None => return Ok(None),
            Some(Value::String(s)) => s
                .split(',')
                .map(|part| part.trim().parse::<i64>())
                .collect::<Result<_, _>>()
                .map_err(|e| TileError::invalid_argument(format!("parameter '{key}': {e}")))?,
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| item.as_i64())
                .collect::<Option<_>>()
                .ok_or_else(|| TileError::invalid_argument(format!("parameter '{key}' must hold integers")))?,
            Some(value) => return Err(TileError::invalid_argument(format!("parameter '{key}' is not a rectangle: {value}"))),
        };
        let [x, y, width, height] = numbers[..] else {
            return Err(TileError::invalid_argument(format!(
                "parameter '{key}' needs 4 values, got {}",
                numbers.len()
            )));
        };
        let fit = |v: i64| {
            i32::try_from(v).map_err(|_| TileError::invalid_argument(format!("parameter '{key}' value {v} out of range")))
        };
        Ok(Some(Rectangle::new(fit(x)?, fit(y)?, fit(width)?, fit(height)?)))
    }
}

/// Split on commas that start a new `key=` pair, so that list values such
/// as `border=constant:1,2,3` stay whole.
fn split_pairs(text: &str) -> Vec<&str> {
    let mut pairs = Vec::new();
    let mut start = 0;
    for (index, _) in text.match_indices(',') {
        let rest = &text[index + 1..];
        let next_is_key = rest
            .split_once('=')
            .is_some_and(|(head, _)| !head.contains(',') && !head.trim().is_empty());
        if next_is_key {
            pairs.push(&text[start..index]);
            start = index + 1;
        }
    }
    pairs.push(&text[start..]);
    pairs.into_iter().map(str::trim).filter(|p| !p.is_empty()).collect()
}

struct RegistryEntry {
    factory: OperatorFactory,
    info: OperatorInfo,
}

/// Registry of operators available by name.
///
/// Operators are kept in registration order.
pub struct OperatorRegistry {
    operators: IndexMap<String, RegistryEntry>,
    categories: IndexMap<Category, Vec<String>>,
}

impl OperatorRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            operators: IndexMap::new(),
            categories: IndexMap::new(),
        }
    }

    /// Create a registry pre-populated with built-in operators.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::filters::builtin::register_all(&mut registry);
        registry
    }

    /// Register an operator, replacing any with the same id.
    pub fn register<F>(&mut self, info: OperatorInfo, factory: F)
    where
        F: Fn(&Environment, &[Arc<ImageNode>], &OperatorParams) -> TileResult<Arc<ImageNode>> + Send + Sync + 'static,
    {
        let id = info.id.clone();
        let category = info.category;
        if let Some(previous) = self.operators.shift_remove(&id) {
            if let Some(ids) = self.categories.get_mut(&previous.info.category) {
                ids.retain(|i| *i != id);
            }
        }
        self.operators.insert(
            id.clone(),
            RegistryEntry {
                factory: Arc::new(factory),
                info,
            },
        );
        self.categories.entry(category).or_default().push(id);
    }

    /// Build a node with the operator registered as `id`.
    pub fn create(
        &self,
        id: &str,
        env: &Environment,
        sources: &[Arc<ImageNode>],
        params: &OperatorParams,
    ) -> TileResult<Arc<ImageNode>> {
        let entry = self
            .operators
            .get(id)
            .ok_or_else(|| TileError::invalid_argument(format!("unknown operator '{id}'")))?;
        (entry.factory)(env, sources, params)
    }

    /// Get metadata for an operator.
    pub fn info(&self, id: &str) -> Option<&OperatorInfo> {
        self.operators.get(id).map(|e| &e.info)
    }

    /// All registered ids in registration order.
    pub fn operator_ids(&self) -> impl Iterator<Item = &str> {
        self.operators.keys().map(|s| s.as_str())
    }

    pub fn operators_by_category(&self, category: Category) -> Vec<&str> {
        self.categories
            .get(&category)
            .map(|ids| ids.iter().map(|s| s.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// The single source of an operator that takes exactly one.
pub fn single_source<'a>(id: &str, sources: &'a [Arc<ImageNode>]) -> TileResult<&'a Arc<ImageNode>> {
    match sources {
        [source] => Ok(source),
        _ => Err(TileError::invalid_argument(format!(
            "operator '{id}' takes exactly one source, got {}",
            sources.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::EnvironmentConfig;
    use crate::core::raster::Raster;
    use crate::core::types::SampleType;
    use crate::graph::source::StaticImage;
    use serde_json::json;

    fn source(env: &Environment) -> Arc<ImageNode> {
        let raster = Raster::new(Rectangle::new(0, 0, 4, 4), 1, SampleType::U8);
        ImageNode::source(env, "blank", Arc::new(StaticImage::new(&raster, 4, 4).unwrap())).unwrap()
    }

    fn passthrough() -> OperatorInfo {
        OperatorInfo::new("passthrough", "Passthrough", Category::Area).description("Return the source unchanged")
    }

    fn passthrough_factory(_: &Environment, sources: &[Arc<ImageNode>], _: &OperatorParams) -> TileResult<Arc<ImageNode>> {
        single_source("passthrough", sources).cloned()
    }

    #[test]
    fn test_register_and_create() {
        let env = Environment::new(EnvironmentConfig::default()).unwrap();
        let mut registry = OperatorRegistry::new();
        registry.register(passthrough(), passthrough_factory);
        assert!(registry.info("passthrough").is_some());

        let src = source(&env);
        let node = registry.create("passthrough", &env, &[Arc::clone(&src)], &OperatorParams::new()).unwrap();
        assert_eq!(node.id(), src.id());
        assert!(matches!(
            registry.create("nope", &env, &[src], &OperatorParams::new()),
            Err(TileError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_reregister_replaces_and_keeps_order() {
        let mut registry = OperatorRegistry::new();
        registry.register(passthrough(), passthrough_factory);
        registry.register(OperatorInfo::new("identity", "Identity", Category::Area), passthrough_factory);
        registry.register(OperatorInfo::new("passthrough", "Passthrough", Category::Untiled), passthrough_factory);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.operator_ids().collect::<Vec<_>>(), vec!["identity", "passthrough"]);
        assert_eq!(registry.operators_by_category(Category::Area), vec!["identity"]);
        assert_eq!(registry.operators_by_category(Category::Untiled), vec!["passthrough"]);
        assert_eq!(registry.info("passthrough").map(|info| info.category), Some(Category::Untiled));
    }

    #[test]
    fn test_builtins_present() {
        let registry = OperatorRegistry::with_builtins();
        let ids: Vec<_> = registry.operator_ids().collect();
        for id in ["box_blur", "max_filter", "invert", "normalize", "statistics"] {
            assert!(ids.contains(&id), "missing {id}");
        }
        assert_eq!(registry.operators_by_category(Category::Statistics), vec!["statistics"]);
    }

    #[test]
    fn test_params_parse() {
        let params = OperatorParams::parse("radius=2, border=constant:1,2,3,name=blur,scale=0.5").unwrap();
        assert_eq!(params.get_i64("radius", 0).unwrap(), 2);
        assert_eq!(params.get_f64("scale", 1.0).unwrap(), 0.5);
        assert_eq!(params.get_str("name").unwrap(), Some("blur"));
        assert_eq!(params.border().unwrap(), Some(BorderPolicy::Constant(vec![1.0, 2.0, 3.0])));
        assert_eq!(params.get_i64("missing", 7).unwrap(), 7);
        assert!(params.get_i64("name", 0).is_err());
        assert!(OperatorParams::parse("radius").is_err());
        assert!(OperatorParams::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_params_rect_and_limits() {
        let params = OperatorParams::new()
            .with("roi", "1, 2, 3, 4")
            .with("area", json!([0, 0, 5, 5]))
            .with("bad", json!([1, 2]))
            .with("radius", -1);
        assert_eq!(params.get_rect("roi").unwrap(), Some(Rectangle::new(1, 2, 3, 4)));
        assert_eq!(params.get_rect("area").unwrap(), Some(Rectangle::new(0, 0, 5, 5)));
        assert!(params.get_rect("bad").is_err());
        assert_eq!(params.get_rect("none").unwrap(), None);
        assert!(params.get_i32_at_least("radius", 1, 0).is_err());
        assert_eq!(params.get_i32_at_least("other", 1, 0).unwrap(), 1);
    }

    #[test]
    fn test_params_json_round_trip() {
        let params: OperatorParams = serde_json::from_str(r#"{"radius": 3, "border": "reflect"}"#).unwrap();
        assert_eq!(params.border().unwrap(), Some(BorderPolicy::Reflect));
        assert_eq!(params.len(), 2);
    }
}
