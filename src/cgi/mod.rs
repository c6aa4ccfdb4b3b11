//! CGI/1.1 meta-variables and the script side of the protocol.
//!
//! [`env`] turns an HTTP request into the environment of a CGI script and
//! [`response`] parses the header block a script writes back.

use std::borrow::Borrow;
use std::ffi::OsStr;
use std::fmt;

use compact_str::CompactString;
use smallvec::SmallVec;

mod intern;
pub mod env;
pub mod response;

pub use intern::StaticVarName;
pub use StaticVarName::*;


const SMALLVEC_BASE_SIZE: usize = std::mem::size_of::<SmallVec<[u8; 0]>>();
// Maximum number of inline bytes before SmallVec exceeds SMALLVEC_BASE_SIZE.
// This derives from SmallVec's layout, which uses 1 usize as discriminant.
const INLINE_BYTES: usize = SMALLVEC_BASE_SIZE - std::mem::size_of::<usize>();

/// Storage for variable values. Most values (ports, methods, addresses) fit
/// inline.
pub type SmallBytes = SmallVec<[u8; INLINE_BYTES]>;


/// A string wrapper for CGI/1.1 meta-variable names.
///
/// CGI/1.1 specifies variable names as case-insensitive (RFC 3875,
/// Section 4.1), hence this wrapper provides case-insensitive equality,
/// and ordering implementations for its wrapped string. The string
/// itself is not modified.
#[derive(Debug, ref_cast::RefCastCustom)]
#[repr(transparent)]
pub struct VarName(str);

impl VarName {
    /// Wraps a string reference in a [`VarName`].
    ///
    /// [`VarName`] also implements [`From<&T>`] for any `T: AsRef<str>`,
    /// which includes [`StaticVarName`].
    #[ref_cast::ref_cast_custom]
    // Unsafe code is generated and checked by ref-cast
    #[allow(unsafe_code, clippy::let_underscore_untyped)]
    #[must_use]
    pub const fn new(s: &str) -> &Self;

    #[inline]
    fn norm_iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.as_bytes().iter().map(u8::to_ascii_uppercase)
    }
}

impl<'a, T: AsRef<str> + ?Sized> From<&'a T> for &'a VarName {
    #[inline]
    fn from(v: &'a T) -> Self {
        VarName::new(v.as_ref())
    }
}

impl From<StaticVarName> for &VarName {
    #[inline]
    fn from(v: StaticVarName) -> Self {
        VarName::new(v.into())
    }
}

impl fmt::Display for VarName {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl PartialEq for VarName {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}
impl Eq for VarName {}

impl PartialOrd for VarName {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VarName {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.norm_iter().cmp(other.norm_iter())
    }
}



// Header-derived names like HTTP_ACCEPT_LANGUAGE still fit CompactString's
// inline buffer, so building an environment rarely allocates for names.
#[derive(Clone)]
enum VarNameInner {
    Static(StaticVarName),
    Custom(CompactString),
}

/// An owned variant of [`VarName`] for use in data structures.
///
/// Well-known CGI/1.1 variable and HTTP header names are stored as a
/// [`StaticVarName`]. Any other name is stored as an actual string, inline
/// if it is short enough.
#[derive(Clone)]
#[repr(transparent)]
pub struct OwnedVarName(VarNameInner);

impl OwnedVarName {
    /// Maps an HTTP request header name to its `HTTP_*` meta-variable
    /// (RFC 3875, Section 4.1.18).
    ///
    /// The name is uppercased and `-` is replaced with `_`. Returns [`None`]
    /// for names containing anything but ASCII alphanumerics, `-`, `_`, and
    /// `.`, as those cannot be represented faithfully in an environment.
    #[must_use]
    pub fn from_header(name: &http::HeaderName) -> Option<Self> {
        let raw = name.as_str();
        let valid = |b: u8| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.');
        if raw.is_empty() || !raw.bytes().all(valid) {
            return None;
        }

        let mut var = CompactString::with_capacity(5 + raw.len());
        var.push_str("HTTP_");
        var.extend(raw.chars().map(|c| if c == '-' { '_' } else { c.to_ascii_uppercase() }));
        Some(var.into())
    }

    /// Returns the name as an [`OsStr`] for use with process spawning APIs.
    #[inline]
    #[must_use]
    pub fn as_os_str(&self) -> &OsStr {
        OsStr::new(self.as_ref())
    }

    // Internal alias because self.borrow() can't infer type
    #[inline]
    fn as_var(&self) -> &VarName {
        self.borrow()
    }
}

impl From<StaticVarName> for OwnedVarName {
    #[inline]
    fn from(v: StaticVarName) -> Self {
        Self(VarNameInner::Static(v))
    }
}

impl From<&str> for OwnedVarName {
    fn from(v: &str) -> Self {
        Self(match v.parse() {
            Ok(s) => VarNameInner::Static(s),
            Err(_) => VarNameInner::Custom(v.into()),
        })
    }
}

impl From<CompactString> for OwnedVarName {
    fn from(v: CompactString) -> Self {
        Self(match v.parse() {
            Ok(s) => VarNameInner::Static(s),
            Err(_) => VarNameInner::Custom(v),
        })
    }
}

impl From<&VarName> for OwnedVarName {
    #[inline]
    fn from(v: &VarName) -> Self {
        v.0.into()
    }
}

impl AsRef<str> for OwnedVarName {
    #[inline]
    fn as_ref(&self) -> &str {
        match &self.0 {
            VarNameInner::Static(s) => s.as_ref(),
            VarNameInner::Custom(s) => s.as_ref(),
        }
    }
}

impl Borrow<VarName> for OwnedVarName {
    #[inline]
    fn borrow(&self) -> &VarName {
        self.as_ref().into()
    }
}

impl ToOwned for VarName {
    type Owned = OwnedVarName;

    #[inline]
    fn to_owned(&self) -> Self::Owned {
        self.into()
    }
}

impl fmt::Debug for OwnedVarName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "OwnedVarName({:?})", self.as_ref())
    }
}

impl fmt::Display for OwnedVarName {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self.as_ref(), f)
    }
}

impl PartialEq for OwnedVarName {
    fn eq(&self, other: &Self) -> bool {
        use VarNameInner::*;
        if let (&Static(s1), &Static(s2)) = (&self.0, &other.0) {
            return s1 == s2;
        }
        self.as_var() == other.as_var()
    }
}
impl Eq for OwnedVarName {}

impl PartialOrd for OwnedVarName {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OwnedVarName {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use VarNameInner::*;
        if let (&Static(s1), &Static(s2)) = (&self.0, &other.0) {
            return s1.cmp(&s2);
        }
        self.as_var().cmp(other.as_var())
    }
}
