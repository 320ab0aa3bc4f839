//! Loaded contract: interfaces indexed by name, functions indexed per interface.

use std::path::Path;

use indexmap::IndexMap;

use crate::error::{ContractError, Result};
use crate::types::{Entity, Function, Interface};

#[derive(Debug, Clone, Default)]
pub struct Contract {
    interfaces: IndexMap<String, IndexMap<String, Function>>,
}

impl Contract {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ContractError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&source)
    }

    pub fn from_json(source: &str) -> Result<Self> {
        let entities: Vec<Entity> = serde_json::from_str(source)?;
        Self::from_entities(entities)
    }

    pub fn from_entities(entities: Vec<Entity>) -> Result<Self> {
        let mut contract = Self::default();
        for entity in entities {
            if let Entity::Interface(iface) = entity {
                contract.add_interface(iface)?;
            }
        }
        tracing::debug!(
            interfaces = contract.interfaces.len(),
            methods = ?contract.methods().collect::<Vec<_>>(),
            "Loaded service contract"
        );
        Ok(contract)
    }

    fn add_interface(&mut self, iface: Interface) -> Result<()> {
        if self.interfaces.contains_key(&iface.name) {
            return Err(ContractError::DuplicateInterface(iface.name));
        }
        let mut functions = IndexMap::with_capacity(iface.functions.len());
        for func in iface.functions {
            if functions.contains_key(&func.name) {
                return Err(ContractError::DuplicateFunction {
                    interface: iface.name,
                    function: func.name,
                });
            }
            functions.insert(func.name.clone(), func);
        }
        self.interfaces.insert(iface.name, functions);
        Ok(())
    }

    /// Resolve a qualified `Interface.function` name.
    pub fn function(&self, method: &str) -> Option<&Function> {
        let (iface, func) = method.split_once('.')?;
        self.interfaces.get(iface)?.get(func)
    }

    /// Qualified names of every function, in declaration order.
    pub fn methods(&self) -> impl Iterator<Item = String> + '_ {
        self.interfaces.iter().flat_map(|(iface, funcs)| {
            funcs.keys().map(move |func| format!("{iface}.{func}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDL: &str = r#"[
        {"type": "struct", "name": "Point", "fields": []},
        {"type": "interface", "name": "Default", "functions": [
            {"name": "echo", "params": [{"name": "x", "type": "string"}], "returns": {"type": "string"}},
            {"name": "add", "params": [{"name": "a", "type": "int"}, {"name": "b", "type": "int"}]}
        ]},
        {"type": "interface", "name": "Geo", "functions": [
            {"name": "origin", "params": [], "returns": {"type": "Point"}}
        ]},
        {"type": "meta", "barrister_version": "0.1.6", "checksum": "abc"}
    ]"#;

    #[test]
    fn resolves_qualified_methods() {
        let contract = Contract::from_json(IDL).unwrap();
        assert_eq!(contract.function("Default.echo").unwrap().params.len(), 1);
        assert!(contract.function("Geo.origin").is_some());
        assert!(contract.function("Default.missing").is_none());
        assert!(contract.function("Nope.echo").is_none());
        assert!(contract.function("echo").is_none());
    }

    #[test]
    fn methods_keep_declaration_order() {
        let contract = Contract::from_json(IDL).unwrap();
        let methods: Vec<String> = contract.methods().collect();
        assert_eq!(methods, vec!["Default.echo", "Default.add", "Geo.origin"]);
    }

    #[test]
    fn rejects_duplicate_functions() {
        let idl = r#"[{"type": "interface", "name": "Default", "functions": [
            {"name": "a", "params": []}, {"name": "a", "params": []}
        ]}]"#;
        let err = Contract::from_json(idl).unwrap_err();
        assert!(matches!(err, ContractError::DuplicateFunction { .. }));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            Contract::from_json("{not json").unwrap_err(),
            ContractError::Parse(_)
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = Contract::from_file("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.json"));
    }
}
