//! Cheaply cloneable, immutable string type used throughout the fabric for
//! tags, hostnames, and other identifiers that are cloned far more often
//! than they are constructed.

pub type Strng = arcstr::ArcStr;

pub fn new(s: impl AsRef<str>) -> Strng {
	arcstr::ArcStr::from(s.as_ref())
}

pub fn literal(s: &'static str) -> Strng {
	arcstr::ArcStr::from(s)
}

pub trait RichStrng {
	fn as_str(&self) -> &str;
}

impl RichStrng for Strng {
	fn as_str(&self) -> &str {
		self.as_ref()
	}
}
