//! Resource name parsing and canonicalization, per spec.md §4.6.
//!
//! An old-style name is an opaque string (e.g. `"my-listener"`) and always
//! belongs to the unnamed top-level authority. A new-style name is a
//! `xdstp://<authority>/<type>/<id>?<params>` URI whose context parameters
//! must be lexicographically canonicalized before use as a cache key, so that
//! two watchers naming the same resource with differently-ordered parameters
//! share one subscription and one cache entry.

use std::fmt;

use indexmap::IndexMap;
use xds_core::strng::{self, Strng};

const SCHEME: &str = "xdstp://";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceName {
	OldStyle(Strng),
	NewStyle(NewStyleName),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NewStyleName {
	pub authority: Strng,
	pub type_name: Strng,
	pub id: Strng,
	/// Sorted lexicographically by key; this is what makes two
	/// differently-ordered queries canonicalize identically.
	pub context_params: IndexMap<String, String>,
}

impl ResourceName {
	/// Parses a resource name as received from a watcher or a wire response.
	/// Old-style names never fail to parse; new-style names fail only if the
	/// `xdstp://` URI is structurally malformed (missing authority/type/id).
	pub fn parse(raw: &str) -> Result<ResourceName, String> {
		if let Some(rest) = raw.strip_prefix(SCHEME) {
			let (path_and_query, authority) = match rest.find('/') {
				Some(idx) => (&rest[idx + 1..], &rest[..idx]),
				None => return Err(format!("xdstp name {raw:?} missing authority separator")),
			};
			let (path, query) = match path_and_query.find('?') {
				Some(idx) => (&path_and_query[..idx], Some(&path_and_query[idx + 1..])),
				None => (path_and_query, None),
			};
			let mut segments = path.splitn(2, '/');
			let type_name = segments
				.next()
				.filter(|s| !s.is_empty())
				.ok_or_else(|| format!("xdstp name {raw:?} missing resource type"))?;
			let id = segments
				.next()
				.filter(|s| !s.is_empty())
				.ok_or_else(|| format!("xdstp name {raw:?} missing resource id"))?;

			let mut context_params: IndexMap<String, String> = IndexMap::new();
			if let Some(query) = query {
				for pair in query.split('&').filter(|p| !p.is_empty()) {
					match pair.split_once('=') {
						Some((k, v)) => {
							context_params.insert(k.to_string(), v.to_string());
						}
						None => {
							context_params.insert(pair.to_string(), String::new());
						}
					}
				}
			}
			context_params.sort_keys();

			Ok(ResourceName::NewStyle(NewStyleName {
				authority: strng::new(authority),
				type_name: strng::new(type_name),
				id: strng::new(id),
				context_params,
			}))
		} else {
			Ok(ResourceName::OldStyle(strng::new(raw)))
		}
	}

	/// The authority this name belongs to. Old-style names and the empty
	/// `xdstp:///` authority both resolve to the top-level authority.
	pub fn authority(&self) -> &str {
		match self {
			ResourceName::OldStyle(_) => "",
			ResourceName::NewStyle(n) => &n.authority,
		}
	}

	/// The canonical wire/cache-key form: context parameters re-serialized
	/// in sorted order. Two names differing only in parameter order produce
	/// an identical canonical string.
	pub fn canonical(&self) -> Strng {
		match self {
			ResourceName::OldStyle(s) => s.clone(),
			ResourceName::NewStyle(n) => strng::new(n.to_string()),
		}
	}
}

impl fmt::Display for NewStyleName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{SCHEME}{}/{}/{}", self.authority, self.type_name, self.id)?;
		if !self.context_params.is_empty() {
			f.write_str("?")?;
			for (i, (k, v)) in self.context_params.iter().enumerate() {
				if i > 0 {
					f.write_str("&")?;
				}
				write!(f, "{k}={v}")?;
			}
		}
		Ok(())
	}
}

impl fmt::Display for ResourceName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ResourceName::OldStyle(s) => f.write_str(s),
			ResourceName::NewStyle(n) => n.fmt(f),
		}
	}
}
