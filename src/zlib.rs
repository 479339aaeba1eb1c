//! SPDY header-block compression.
//!
//! Every SPDY connection carries two independent zlib streams seeded with a
//! version-specific dictionary: one compressing outbound header blocks, one
//! inflating inbound blocks. Both are stateful for the life of the connection,
//! so a lost or reordered block is unrecoverable and treated as fatal.
//!
//! A block is the pair count followed by length-prefixed name/value pairs
//! (16-bit fields on SPDY/2, 32-bit on SPDY/3), deflated with a SYNC flush so
//! each block is self-delimiting on the wire.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

use crate::error::{Error, Result};
use crate::headers::Headers;
use crate::version::Version;

/// Dictionary from the SPDY/2 draft. The missing hyphen in
/// `if-unmodifiedsince` and the duplicated `warning`/`public` entries are in
/// the published dictionary; both peers must use it byte for byte. The
/// trailing NUL is part of the dictionary.
const DICTIONARY_V2: &[u8] =
    b"optionsgetheadpostputdeletetraceacceptaccept-charsetaccept-encodingaccept-\
      languageauthorizationexpectfromhostif-modified-sinceif-matchif-none-matchi\
      f-rangeif-unmodifiedsincemax-forwardsproxy-authorizationrangerefererteuser\
      -agent10010120020120220320420520630030130230330430530630740040140240340440\
      5406407408409410411412413414415416417500501502503504505accept-rangesageeta\
      glocationproxy-authenticatepublicretry-afterservervarywarningwww-authentic\
      ateallowcontent-basecontent-encodingcache-controlconnectiondatetrailertran\
      sfer-encodingupgradeviawarningcontent-languagecontent-lengthcontent-locati\
      oncontent-md5content-rangecontent-typeetagexpireslast-modifiedset-cookieMo\
      ndayTuesdayWednesdayThursdayFridaySaturdaySundayJanFebMarAprMayJunJulAugSe\
      pOctNovDecchunkedtext/htmlimage/pngimage/jpgimage/gifapplication/xmlapplic\
      ation/xhtmltext/plainpublicmax-agecharset=iso-8859-1utf-8gzipdeflateHTTP/1\
      .1statusversionurl\0";

/// Dictionary from the SPDY/3 draft: length-prefixed words followed by a raw
/// tail of status lines, dates and tokens.
const DICTIONARY_V3: &[u8] =
    b"\x00\x00\x00\x07options\x00\x00\x00\x04head\x00\x00\x00\x04post\
      \x00\x00\x00\x03put\x00\x00\x00\x06delete\x00\x00\x00\x05trace\
      \x00\x00\x00\x06accept\x00\x00\x00\x0eaccept-charset\
      \x00\x00\x00\x0faccept-encoding\x00\x00\x00\x0faccept-language\
      \x00\x00\x00\x0daccept-ranges\x00\x00\x00\x03age\x00\x00\x00\x05allow\
      \x00\x00\x00\x0dauthorization\x00\x00\x00\x0dcache-control\
      \x00\x00\x00\x0aconnection\x00\x00\x00\x0ccontent-base\
      \x00\x00\x00\x10content-encoding\x00\x00\x00\x10content-language\
      \x00\x00\x00\x0econtent-length\x00\x00\x00\x10content-location\
      \x00\x00\x00\x0bcontent-md5\x00\x00\x00\x0dcontent-range\
      \x00\x00\x00\x0ccontent-type\x00\x00\x00\x04date\x00\x00\x00\x04etag\
      \x00\x00\x00\x06expect\x00\x00\x00\x07expires\x00\x00\x00\x04from\
      \x00\x00\x00\x04host\x00\x00\x00\x08if-match\
      \x00\x00\x00\x11if-modified-since\x00\x00\x00\x0dif-none-match\
      \x00\x00\x00\x08if-range\x00\x00\x00\x13if-unmodified-since\
      \x00\x00\x00\x0dlast-modified\x00\x00\x00\x08location\
      \x00\x00\x00\x0cmax-forwards\x00\x00\x00\x06pragma\
      \x00\x00\x00\x12proxy-authenticate\x00\x00\x00\x13proxy-authorization\
      \x00\x00\x00\x05range\x00\x00\x00\x07referer\x00\x00\x00\x0bretry-after\
      \x00\x00\x00\x06server\x00\x00\x00\x02te\x00\x00\x00\x07trailer\
      \x00\x00\x00\x11transfer-encoding\x00\x00\x00\x07upgrade\
      \x00\x00\x00\x0auser-agent\x00\x00\x00\x04vary\x00\x00\x00\x03via\
      \x00\x00\x00\x07warning\x00\x00\x00\x10www-authenticate\
      \x00\x00\x00\x06method\x00\x00\x00\x03get\x00\x00\x00\x06status\
      \x00\x00\x00\x06200 OK\x00\x00\x00\x07version\x00\x00\x00\x08HTTP/1.1\
      \x00\x00\x00\x03url\x00\x00\x00\x06public\x00\x00\x00\x0aset-cookie\
      \x00\x00\x00\x0akeep-alive\x00\x00\x00\x06origin\
      100101201202205206300302303304305306307402405406407408409410411412413414\
      415416417502504505203 Non-Authoritative Information204 No Content301 Mov\
      ed Permanently400 Bad Request401 Unauthorized403 Forbidden404 Not Found5\
      00 Internal Server Error501 Not Implemented503 Service UnavailableJan Fe\
      b Mar Apr May Jun Jul Aug Sept Oct Nov Dec 00:00:00 Mon, Tue, Wed, Thu, \
      Fri, Sat, Sun, GMTchunked,text/html,image/png,image/jpg,image/gif,applic\
      ation/xml,application/xhtml+xml,text/plain,text/javascript,publicprivate\
      max-age=gzip,deflate,sdchcharset=utf-8charset=iso-8859-1,utf-,*,enq=0.";

fn dictionary(version: Version) -> &'static [u8] {
    match version {
        Version::V2 => DICTIONARY_V2,
        Version::V3 => DICTIONARY_V3,
    }
}

/// Stateful deflate stream for outbound header blocks.
pub struct HeaderCompressor {
    version: Version,
    z: Compress,
}

impl HeaderCompressor {
    pub fn new(version: Version) -> Self {
        let mut z = Compress::new(Compression::default(), true);
        // The dictionary must be installed before the first byte is deflated.
        // set_dictionary on a fresh zlib stream cannot fail with a valid
        // dictionary, but surface it rather than swallow it.
        if let Err(e) = z.set_dictionary(dictionary(version)) {
            tracing::error!("failed to seed compression dictionary: {}", e);
        }
        Self { version, z }
    }

    /// Compress an ordered header list into a wire header block.
    pub fn encode(&mut self, headers: &Headers) -> Result<Bytes> {
        let plain = serialize_block(self.version, headers);
        let mut out = Vec::with_capacity(plain.len() / 2 + 64);
        let start_in = self.z.total_in();
        loop {
            let consumed = (self.z.total_in() - start_in) as usize;
            self.z
                .compress_vec(&plain[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| Error::compression(e.to_string()))?;
            let consumed = (self.z.total_in() - start_in) as usize;
            if consumed == plain.len() && out.len() < out.capacity() {
                break;
            }
            out.reserve(out.capacity().max(64));
        }
        Ok(out.into())
    }
}

/// Stateful inflate stream for inbound header blocks.
pub struct HeaderDecompressor {
    version: Version,
    z: Decompress,
}

impl HeaderDecompressor {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            z: Decompress::new(true),
        }
    }

    /// Inflate and parse one wire header block.
    pub fn decode(&mut self, block: &[u8]) -> Result<Headers> {
        let mut out = Vec::with_capacity(block.len() * 4 + 64);
        let start_in = self.z.total_in();
        loop {
            let consumed = (self.z.total_in() - start_in) as usize;
            match self
                .z
                .decompress_vec(&block[consumed..], &mut out, FlushDecompress::Sync)
            {
                Ok(_) => {
                    let consumed = (self.z.total_in() - start_in) as usize;
                    if consumed == block.len() && out.len() < out.capacity() {
                        break;
                    }
                    out.reserve(out.capacity().max(256));
                }
                // zlib stops at the header checksum and asks for the
                // dictionary on the very first block.
                Err(e) if e.needs_dictionary().is_some() => {
                    self.z
                        .set_dictionary(dictionary(self.version))
                        .map_err(|e| Error::compression(e.to_string()))?;
                }
                Err(e) => return Err(Error::compression(e.to_string())),
            }
        }
        parse_block(self.version, &out)
    }
}

fn serialize_block(version: Version, headers: &Headers) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);
    put_len(&mut buf, version, headers.len());
    for (name, value) in headers.iter() {
        // Header names are lowercase on the wire.
        put_len(&mut buf, version, name.len());
        buf.extend(name.bytes().map(|b| b.to_ascii_lowercase()));
        put_len(&mut buf, version, value.len());
        buf.extend_from_slice(value.as_bytes());
    }
    buf
}

fn put_len(buf: &mut BytesMut, version: Version, len: usize) {
    match version {
        Version::V2 => buf.put_u16(len as u16),
        Version::V3 => buf.put_u32(len as u32),
    }
}

fn parse_block(version: Version, mut body: &[u8]) -> Result<Headers> {
    let count = take_len(version, &mut body)?;
    let mut headers = Headers::new();
    for _ in 0..count {
        let name = take_field(version, &mut body)?;
        let value = take_field(version, &mut body)?;
        if name.is_empty() {
            return Err(Error::compression("empty header name in block"));
        }
        headers.insert(name, value);
    }
    Ok(headers)
}

fn take_len(version: Version, body: &mut &[u8]) -> Result<usize> {
    if body.len() < version.nv_len_width() {
        return Err(Error::compression("truncated header block"));
    }
    Ok(match version {
        Version::V2 => body.get_u16() as usize,
        Version::V3 => body.get_u32() as usize,
    })
}

fn take_field(version: Version, body: &mut &[u8]) -> Result<String> {
    let len = take_len(version, body)?;
    if body.len() < len {
        return Err(Error::compression("header field length past end of block"));
    }
    let field = String::from_utf8(body[..len].to_vec())
        .map_err(|_| Error::compression("header field is not valid UTF-8"))?;
    body.advance(len);
    Ok(field)
}
