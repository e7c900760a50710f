// SPDX-License-Identifier: MIT

//! The data model: types, forms, properties and tag properties
//!
//! Models are declared in YAML ([`ModelDef`]) and resolved once into a
//! [`DataModel`]. The built-in `syn:tag` form and the `.seen`/`.created`
//! universal properties are always present.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use super::error::{Result, StormError};
use super::types::{StormType, TypeKind};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelDef {
    #[serde(default)]
    pub types: Vec<TypeDef>,
    #[serde(default)]
    pub forms: Vec<FormDef>,
    #[serde(default)]
    pub univs: Vec<PropDef>,
    #[serde(default)]
    pub tagprops: Vec<PropDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TypeDef {
    pub name: String,
    #[serde(flatten)]
    pub kind: TypeKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FormDef {
    pub name: String,
    /// Defaults to a type of the same name
    #[serde(default, rename = "type")]
    pub typename: Option<String>,
    #[serde(default)]
    pub props: Vec<PropDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PropDef {
    pub name: String,
    #[serde(rename = "type")]
    pub typename: String,
    #[serde(default)]
    pub ro: bool,
}

/// A resolved property
#[derive(Debug)]
pub struct Prop {
    /// Relative name (`asn`, `.seen`)
    pub name: String,
    /// Fully qualified name (`inet:ipv4:asn`, `inet:ipv4.seen`, `.seen`)
    pub full: String,
    /// Owning form, `None` for a bare universal
    pub form: Option<String>,
    pub styp: Arc<StormType>,
    pub ro: bool,
    pub univ: bool,
}

/// How a form property refers to other nodes
#[derive(Debug, Clone, PartialEq)]
pub enum PropRef {
    /// A scalar property typed as a form
    Form { prop: String, form: String },
    /// An array property whose elements are a form
    Array { prop: String, form: String },
    /// An ndef property that may point at any form
    Ndef { prop: String },
}

impl PropRef {
    pub fn prop(&self) -> &str {
        match self {
            Self::Form { prop, .. } | Self::Array { prop, .. } | Self::Ndef { prop } => prop,
        }
    }
}

#[derive(Debug)]
pub struct Form {
    pub name: String,
    pub styp: Arc<StormType>,
    props: BTreeMap<String, Arc<Prop>>,
    refs: Vec<PropRef>,
}

impl Form {
    /// A relative or universal property of this form
    pub fn prop(&self, name: &str) -> Option<&Arc<Prop>> {
        self.props.get(name)
    }

    pub fn props(&self) -> impl Iterator<Item = &Arc<Prop>> {
        self.props.values()
    }

    /// Outbound node references declared by this form's properties
    pub fn refs(&self) -> &[PropRef] {
        &self.refs
    }

    pub fn is_edge(&self) -> bool {
        self.styp.is_edge()
    }
}

#[derive(Debug)]
pub struct DataModel {
    types: HashMap<String, Arc<StormType>>,
    forms: BTreeMap<String, Arc<Form>>,
    props: HashMap<String, Arc<Prop>>,
    univs: BTreeMap<String, Arc<Prop>>,
    tagprops: HashMap<String, Arc<Prop>>,
}

fn builtin_types() -> Vec<(&'static str, TypeKind)> {
    vec![
        ("str", TypeKind::Str { lower: false }),
        ("int", TypeKind::Int { min: None, max: None }),
        ("bool", TypeKind::Bool),
        ("time", TypeKind::Time),
        ("ival", TypeKind::Ival),
        ("ndef", TypeKind::Ndef { forms: None }),
        ("edge", TypeKind::Edge),
        ("syn:tag", TypeKind::Str { lower: true }),
    ]
}

impl DataModel {
    /// Resolve a model definition, merged with the built-ins
    pub fn new(def: &ModelDef) -> Result<Self> {
        let mut defs: HashMap<String, TypeKind> = builtin_types()
            .into_iter()
            .map(|(name, kind)| (name.to_string(), kind))
            .collect();
        for tdef in &def.types {
            defs.insert(tdef.name.clone(), tdef.kind.clone());
        }

        let mut formdefs = vec![FormDef {
            name: "syn:tag".to_string(),
            typename: None,
            props: vec![
                prop_def("up", "syn:tag", true),
                prop_def("base", "str", true),
                prop_def("depth", "int", true),
            ],
        }];
        formdefs.extend(def.forms.iter().cloned());

        // a form declared over another type gets its own type under the form name
        for fdef in &formdefs {
            if let Some(base) = fdef.typename.as_ref().filter(|name| **name != fdef.name) {
                let kind = defs
                    .get(base)
                    .cloned()
                    .ok_or_else(|| StormError::bad_valu(base.clone(), "unknown type"))?;
                defs.insert(fdef.name.clone(), kind);
            }
        }

        let formnames: Vec<String> = formdefs.iter().map(|f| f.name.clone()).collect();
        let mut builder = TypeBuilder {
            defs: &defs,
            formnames: &formnames,
            built: HashMap::new(),
        };

        let mut univdefs = vec![prop_def(".seen", "ival", false), prop_def(".created", "time", true)];
        univdefs.extend(def.univs.iter().map(|udef| {
            let mut udef = udef.clone();
            if !udef.name.starts_with('.') {
                udef.name = format!(".{}", udef.name);
            }
            udef
        }));

        let mut univs = BTreeMap::new();
        let mut props = HashMap::new();
        for udef in &univdefs {
            let prop = Arc::new(Prop {
                name: udef.name.clone(),
                full: udef.name.clone(),
                form: None,
                styp: builder.resolve(&udef.typename, 0)?,
                ro: udef.ro,
                univ: true,
            });
            props.insert(prop.full.clone(), Arc::clone(&prop));
            univs.insert(prop.name.clone(), prop);
        }

        let mut forms = BTreeMap::new();
        for fdef in &formdefs {
            let styp = builder.resolve(&fdef.name, 0)?;
            let mut fprops = BTreeMap::new();
            let mut refs = Vec::new();
            for pdef in &fdef.props {
                let pstyp = builder.resolve(&pdef.typename, 0)?;
                if pstyp.is_form() {
                    refs.push(PropRef::Form {
                        prop: pdef.name.clone(),
                        form: pstyp.name().to_string(),
                    });
                } else if let Some(elem) = pstyp.elem().filter(|elem| elem.is_form()) {
                    refs.push(PropRef::Array {
                        prop: pdef.name.clone(),
                        form: elem.name().to_string(),
                    });
                } else if pstyp.is_ndef() {
                    refs.push(PropRef::Ndef {
                        prop: pdef.name.clone(),
                    });
                }
                let prop = Arc::new(Prop {
                    name: pdef.name.clone(),
                    full: format!("{}:{}", fdef.name, pdef.name),
                    form: Some(fdef.name.clone()),
                    styp: pstyp,
                    ro: pdef.ro,
                    univ: false,
                });
                props.insert(prop.full.clone(), Arc::clone(&prop));
                fprops.insert(prop.name.clone(), prop);
            }
            if styp.is_edge() {
                for (name, typename) in [("n1", "ndef"), ("n2", "ndef"), ("n1:form", "str"), ("n2:form", "str")] {
                    let prop = Arc::new(Prop {
                        name: name.to_string(),
                        full: format!("{}:{}", fdef.name, name),
                        form: Some(fdef.name.clone()),
                        styp: builder.resolve(typename, 0)?,
                        ro: true,
                        univ: false,
                    });
                    props.insert(prop.full.clone(), Arc::clone(&prop));
                    fprops.insert(prop.name.clone(), prop);
                }
            }
            for univ in univs.values() {
                let prop = Arc::new(Prop {
                    name: univ.name.clone(),
                    full: format!("{}{}", fdef.name, univ.name),
                    form: Some(fdef.name.clone()),
                    styp: Arc::clone(&univ.styp),
                    ro: univ.ro,
                    univ: true,
                });
                props.insert(prop.full.clone(), Arc::clone(&prop));
                fprops.insert(prop.name.clone(), prop);
            }
            forms.insert(
                fdef.name.clone(),
                Arc::new(Form {
                    name: fdef.name.clone(),
                    styp,
                    props: fprops,
                    refs,
                }),
            );
        }

        let mut tagprops = HashMap::new();
        for tdef in &def.tagprops {
            let prop = Arc::new(Prop {
                name: tdef.name.clone(),
                full: tdef.name.clone(),
                form: None,
                styp: builder.resolve(&tdef.typename, 0)?,
                ro: tdef.ro,
                univ: false,
            });
            tagprops.insert(prop.name.clone(), prop);
        }

        let types = builder.built;
        log::debug!("Resolved data model with {} forms and {} types", forms.len(), types.len());
        Ok(Self {
            types,
            forms,
            props,
            univs,
            tagprops,
        })
    }

    /// A model with only the built-in form and universal properties
    pub fn builtin() -> Result<Self> {
        Self::new(&ModelDef::default())
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let def: ModelDef = serde_yaml::from_str(content)?;
        Self::new(&def)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn form(&self, name: &str) -> Option<&Arc<Form>> {
        self.forms.get(name)
    }

    pub fn forms(&self) -> impl Iterator<Item = &Arc<Form>> {
        self.forms.values()
    }

    pub fn req_form(&self, name: &str) -> Result<&Arc<Form>> {
        self.form(name).ok_or_else(|| StormError::NoSuchForm {
            name: name.to_string(),
        })
    }

    /// A property by full name (`inet:ipv4:asn`, `inet:ipv4.seen`, `.seen`)
    pub fn prop(&self, full: &str) -> Option<&Arc<Prop>> {
        self.props.get(full)
    }

    pub fn univ(&self, name: &str) -> Option<&Arc<Prop>> {
        self.univs.get(name)
    }

    pub fn tagprop(&self, name: &str) -> Option<&Arc<Prop>> {
        self.tagprops.get(name)
    }

    pub fn styp(&self, name: &str) -> Option<&Arc<StormType>> {
        self.types.get(name)
    }

    /// Every form whose properties reference `dest`
    pub fn forms_referencing<'a>(&'a self, dest: &'a str) -> impl Iterator<Item = (&'a Arc<Form>, &'a PropRef)> {
        self.forms.values().flat_map(move |form| {
            form.refs()
                .iter()
                .filter(move |pref| match pref {
                    PropRef::Form { form, .. } | PropRef::Array { form, .. } => form == dest,
                    PropRef::Ndef { .. } => false,
                })
                .map(move |pref| (form, pref))
        })
    }
}

fn prop_def(name: &str, typename: &str, ro: bool) -> PropDef {
    PropDef {
        name: name.to_string(),
        typename: typename.to_string(),
        ro,
    }
}

struct TypeBuilder<'a> {
    defs: &'a HashMap<String, TypeKind>,
    formnames: &'a [String],
    built: HashMap<String, Arc<StormType>>,
}

impl TypeBuilder<'_> {
    fn resolve(&mut self, name: &str, depth: usize) -> Result<Arc<StormType>> {
        if let Some(styp) = self.built.get(name) {
            return Ok(Arc::clone(styp));
        }
        if depth > 32 {
            return Err(StormError::bad_valu(name, "type definitions are recursive"));
        }
        let kind = self
            .defs
            .get(name)
            .cloned()
            .ok_or_else(|| StormError::bad_valu(name, "unknown type"))?;
        let elem = match &kind {
            TypeKind::Array { elem, .. } => Some(self.resolve(elem, depth + 1)?),
            _ => None,
        };
        let mut fields = Vec::new();
        if let TypeKind::Comp { fields: fdefs } = &kind {
            for field in fdefs {
                fields.push((field.name.clone(), self.resolve(&field.typename, depth + 1)?));
            }
        }
        let is_form = self.formnames.iter().any(|form| form == name);
        let styp = Arc::new(StormType::with_parts(name, kind, is_form, elem, fields));
        self.built.insert(name.to_string(), Arc::clone(&styp));
        Ok(styp)
    }
}
