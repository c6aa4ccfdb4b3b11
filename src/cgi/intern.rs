use std::fmt;


/// A statically-allocated CGI/1.1 variable name.
///
/// Covers the RFC 3875 meta-variables, the extra variables set by this crate,
/// and the `HTTP_*` forms of frequently sent request headers. The variants
/// are re-exported as constants on the [`cgi`](crate::cgi) module and convert
/// into [`VarName`](super::VarName) and [`OwnedVarName`](super::OwnedVarName)
/// without allocating.
#[allow(missing_docs, non_camel_case_types, clippy::upper_case_acronyms)]
#[derive(Clone, Copy, PartialEq, Eq, strum::IntoStaticStr, strum::EnumString)]
#[strum(use_phf, serialize_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum StaticVarName {
    // From RFC 3875, Section 4.1 (CGI/1.1)
    AUTH_TYPE,
    CONTENT_LENGTH,
    CONTENT_TYPE,
    GATEWAY_INTERFACE,
    PATH_INFO,
    PATH_TRANSLATED,
    QUERY_STRING,
    REMOTE_ADDR,
    REMOTE_HOST,
    REMOTE_IDENT,
    REMOTE_USER,
    REQUEST_METHOD,
    SCRIPT_NAME,
    SERVER_NAME,
    SERVER_PORT,
    SERVER_PROTOCOL,
    SERVER_SOFTWARE,

    // Set by common servers, expected by PHP and friends
    DOCUMENT_ROOT,
    REDIRECT_STATUS,
    REMOTE_PORT,
    REQUEST_URI,
    SCRIPT_FILENAME,
    SERVER_ADDR,

    // Host variables commonly passed through
    HOME,
    LANG,
    PATH,
    TZ,

    // Common end-to-end HTTP request headers
    HTTP_ACCEPT,
    HTTP_ACCEPT_CHARSET,
    HTTP_ACCEPT_ENCODING,
    HTTP_ACCEPT_LANGUAGE,
    HTTP_AUTHORIZATION,
    HTTP_CACHE_CONTROL,
    HTTP_CONNECTION,
    HTTP_CONTENT_ENCODING,
    HTTP_COOKIE,
    HTTP_DATE,
    HTTP_EXPECT,
    HTTP_FORWARDED,
    HTTP_HOST,
    HTTP_IF_MATCH,
    HTTP_IF_MODIFIED_SINCE,
    HTTP_IF_NONE_MATCH,
    HTTP_IF_RANGE,
    HTTP_IF_UNMODIFIED_SINCE,
    HTTP_ORIGIN,
    HTTP_PRAGMA,
    HTTP_RANGE,
    HTTP_REFERER,
    HTTP_TE,
    HTTP_TRANSFER_ENCODING,
    HTTP_UPGRADE_INSECURE_REQUESTS,
    HTTP_USER_AGENT,
    HTTP_VIA,
    HTTP_X_FORWARDED_FOR,
    HTTP_X_FORWARDED_HOST,
    HTTP_X_FORWARDED_PROTO,
    HTTP_X_REQUESTED_WITH,
    HTTP_X_REQUEST_ID,
}

impl AsRef<str> for StaticVarName {
    #[inline]
    fn as_ref(&self) -> &str {
        self.into()
    }
}

impl fmt::Debug for StaticVarName {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self.as_ref(), f)
    }
}

impl fmt::Display for StaticVarName {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self.as_ref(), f)
    }
}

impl PartialOrd for StaticVarName {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// Can't derive because variants are ordered by origin, not alphabetically
impl Ord for StaticVarName {
    #[inline]
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Case is normalized by strum during compilation
        self.as_ref().cmp(other.as_ref())
    }
}
