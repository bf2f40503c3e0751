//! Package URL (purl) parsing and canonical rendering.
//!
//! The canonical string is the identity of a package: two purls that render
//! the same canonical string name the same package row.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{ModelError, Result};

const SCHEME: &str = "pkg:";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Purl {
    ty: String,
    namespace: Option<String>,
    name: String,
    version: Option<String>,
    qualifiers: BTreeMap<String, String>,
    subpath: Option<String>,
}

impl Purl {
    /// Builds a purl from already-decoded components, applying the same
    /// normalisation as [`Purl::from_str`].
    pub fn new(
        ty: impl Into<String>,
        namespace: Option<String>,
        name: impl Into<String>,
        version: Option<String>,
    ) -> Result<Self> {
        let ty = ty.into().to_ascii_lowercase();
        if ty.is_empty()
            || !ty
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '-'))
        {
            return Err(ModelError::InvalidPurl(format!("bad type `{ty}`")));
        }
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ModelError::InvalidPurl("missing name".into()));
        }
        let namespace = namespace
            .map(|ns| ns.trim_matches('/').to_string())
            .filter(|ns| !ns.is_empty());
        let version = version.filter(|v| !v.is_empty());

        let (namespace, name) = normalize_for_type(&ty, namespace, name);
        Ok(Self {
            ty,
            namespace,
            name,
            version,
            qualifiers: BTreeMap::new(),
            subpath: None,
        })
    }

    pub fn with_qualifier(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.qualifiers
                .insert(key.into().to_ascii_lowercase(), value);
        }
        self
    }

    pub fn with_subpath(mut self, subpath: impl Into<String>) -> Self {
        self.subpath = normalize_subpath(&subpath.into());
        self
    }

    pub fn ty(&self) -> &str {
        &self.ty
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn qualifiers(&self) -> &BTreeMap<String, String> {
        &self.qualifiers
    }

    pub fn subpath(&self) -> Option<&str> {
        self.subpath.as_deref()
    }

    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

fn normalize_for_type(
    ty: &str,
    namespace: Option<String>,
    name: String,
) -> (Option<String>, String) {
    match ty {
        "github" | "bitbucket" | "golang" => (
            namespace.map(|ns| ns.to_ascii_lowercase()),
            name.to_ascii_lowercase(),
        ),
        "pypi" => (namespace, name.to_ascii_lowercase().replace('_', "-")),
        _ => (namespace, name),
    }
}

fn normalize_subpath(raw: &str) -> Option<String> {
    let segments: Vec<&str> = raw
        .split('/')
        .filter(|segment| !matches!(*segment, "" | "." | ".."))
        .collect();
    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}

fn decode(raw: &str) -> Result<String> {
    urlencoding::decode(raw)
        .map(|value| value.into_owned())
        .map_err(|err| ModelError::InvalidPurl(format!("bad escape: {err}")))
}

impl FromStr for Purl {
    type Err = ModelError;

    fn from_str(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let Some(head) = trimmed.get(..SCHEME.len()) else {
            return Err(ModelError::InvalidPurl(format!(
                "`{trimmed}` has no pkg: scheme"
            )));
        };
        if !head.eq_ignore_ascii_case(SCHEME) {
            return Err(ModelError::InvalidPurl(format!(
                "`{trimmed}` has no pkg: scheme"
            )));
        }
        let mut rest = trimmed[SCHEME.len()..].trim_start_matches('/');

        let mut subpath = None;
        if let Some((before, after)) = rest.rsplit_once('#') {
            let decoded = after
                .split('/')
                .map(decode)
                .collect::<Result<Vec<_>>>()?
                .join("/");
            subpath = normalize_subpath(&decoded);
            rest = before;
        }

        let mut qualifiers = BTreeMap::new();
        if let Some((before, after)) = rest.rsplit_once('?') {
            for pair in after.split('&').filter(|pair| !pair.is_empty()) {
                let (key, value) = pair.split_once('=').ok_or_else(|| {
                    ModelError::InvalidPurl(format!("qualifier `{pair}` has no value"))
                })?;
                let value = decode(value)?;
                if !value.is_empty() {
                    qualifiers.insert(key.to_ascii_lowercase(), value);
                }
            }
            rest = before;
        }

        let rest = rest.trim_end_matches('/');
        let (ty, rest) = rest.split_once('/').ok_or_else(|| {
            ModelError::InvalidPurl(format!("`{trimmed}` has no name"))
        })?;

        let (path, version) = match rest.rsplit_once('@') {
            Some((path, version)) => (path, Some(decode(version)?)),
            None => (rest, None),
        };

        let mut segments = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(decode)
            .collect::<Result<Vec<_>>>()?;
        let name = segments.pop().ok_or_else(|| {
            ModelError::InvalidPurl(format!("`{trimmed}` has no name"))
        })?;
        let namespace = if segments.is_empty() {
            None
        } else {
            Some(segments.join("/"))
        };

        let mut purl = Purl::new(ty, namespace, name, version)?;
        purl.qualifiers = qualifiers;
        purl.subpath = subpath;
        Ok(purl)
    }
}

impl fmt::Display for Purl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}{}/", self.ty)?;
        if let Some(namespace) = &self.namespace {
            for segment in namespace.split('/') {
                write!(f, "{}/", urlencoding::encode(segment))?;
            }
        }
        write!(f, "{}", urlencoding::encode(&self.name))?;
        if let Some(version) = &self.version {
            write!(f, "@{}", urlencoding::encode(version))?;
        }
        if !self.qualifiers.is_empty() {
            let rendered: Vec<String> = self
                .qualifiers
                .iter()
                .map(|(key, value)| {
                    format!("{key}={}", urlencoding::encode(value))
                })
                .collect();
            write!(f, "?{}", rendered.join("&"))?;
        }
        if let Some(subpath) = &self.subpath {
            let encoded: Vec<String> = subpath
                .split('/')
                .map(|segment| urlencoding::encode(segment).into_owned())
                .collect();
            write!(f, "#{}", encoded.join("/"))?;
        }
        Ok(())
    }
}

impl Serialize for Purl {
    fn serialize<S: Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Purl {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
