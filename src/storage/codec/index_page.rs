use crate::buffer::PAGE_SIZE;
use crate::error::{VellumError, VellumResult};
use crate::storage::codec::{CommonCodec, DecodedData, RidCodec};
use crate::storage::index::comparator::KeyComparator;
use crate::storage::page::{
    BPlusTreeInternalPage, BPlusTreeInternalPageHeader, BPlusTreeLeafPage,
    BPlusTreeLeafPageHeader, BPlusTreePage, BPlusTreePageType,
};

/// Page image layout (big-endian u32 fields):
///
/// ```text
/// | page_type(4) | lsn(4) | size(4) | max_size(4) | parent_id(4) | page_id(4) |
/// leaf pages add | next_page_id(4) |
/// ```
///
/// followed by `size` fixed-width `(key, value)` pairs: `key_size` key bytes
/// plus an 8-byte RID for leaves or a 4-byte child page id for internal
/// pages. The unused key of an internal page's entry 0 is stored as zeroes.
pub struct BPlusTreePageCodec;

impl BPlusTreePageCodec {
    pub fn encode(page: &BPlusTreePage, key_size: usize) -> Vec<u8> {
        match page {
            BPlusTreePage::Leaf(page) => BPlusTreeLeafPageCodec::encode(page, key_size),
            BPlusTreePage::Internal(page) => BPlusTreeInternalPageCodec::encode(page, key_size),
        }
    }

    pub fn decode(
        bytes: &[u8],
        key_size: usize,
        comparator: KeyComparator,
    ) -> VellumResult<DecodedData<BPlusTreePage>> {
        let (page_type, _) = BPlusTreePageTypeCodec::decode(bytes)?;
        match page_type {
            BPlusTreePageType::LeafPage => {
                let (page, offset) = BPlusTreeLeafPageCodec::decode(bytes, key_size, comparator)?;
                Ok((BPlusTreePage::Leaf(page), offset))
            }
            BPlusTreePageType::InternalPage => {
                let (page, offset) =
                    BPlusTreeInternalPageCodec::decode(bytes, key_size, comparator)?;
                Ok((BPlusTreePage::Internal(page), offset))
            }
        }
    }
}

pub struct BPlusTreePageTypeCodec;

impl BPlusTreePageTypeCodec {
    pub fn encode(page_type: &BPlusTreePageType) -> Vec<u8> {
        match page_type {
            BPlusTreePageType::LeafPage => CommonCodec::encode_u32(1),
            BPlusTreePageType::InternalPage => CommonCodec::encode_u32(2),
        }
    }

    pub fn decode(bytes: &[u8]) -> VellumResult<DecodedData<BPlusTreePageType>> {
        let (flag, offset) = CommonCodec::decode_u32(bytes)?;
        match flag {
            1 => Ok((BPlusTreePageType::LeafPage, offset)),
            2 => Ok((BPlusTreePageType::InternalPage, offset)),
            _ => Err(VellumError::Internal(format!(
                "invalid b+ tree page type {}",
                flag
            ))),
        }
    }
}

fn encode_key(bytes: &mut Vec<u8>, key: &[u8], key_size: usize) {
    debug_assert!(key.is_empty() || key.len() == key_size);
    let start = bytes.len();
    bytes.resize(start + key_size, 0);
    bytes[start..start + key.len()].copy_from_slice(key);
}

pub struct BPlusTreeLeafPageCodec;

impl BPlusTreeLeafPageCodec {
    pub fn encode(page: &BPlusTreeLeafPage, key_size: usize) -> Vec<u8> {
        let mut bytes = BPlusTreeLeafPageHeaderCodec::encode(&page.header);
        for (key, rid) in page.array.iter() {
            encode_key(&mut bytes, key, key_size);
            bytes.extend(RidCodec::encode(rid));
        }
        assert!(bytes.len() <= PAGE_SIZE, "leaf page image overflows a page");
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode(
        bytes: &[u8],
        key_size: usize,
        comparator: KeyComparator,
    ) -> VellumResult<DecodedData<BPlusTreeLeafPage>> {
        let (header, offset) = BPlusTreeLeafPageHeaderCodec::decode(bytes)?;
        if !matches!(header.page_type, BPlusTreePageType::LeafPage) {
            return Err(VellumError::Internal(
                "page type must be a leaf page".to_string(),
            ));
        }
        let mut left_bytes = &bytes[offset..];

        let mut array = Vec::with_capacity(header.current_size as usize);
        for _ in 0..header.current_size {
            if left_bytes.len() < key_size {
                return Err(VellumError::Internal(
                    "truncated leaf page entry".to_string(),
                ));
            }
            let key = left_bytes[..key_size].to_vec();
            left_bytes = &left_bytes[key_size..];

            let (rid, offset) = RidCodec::decode(left_bytes)?;
            left_bytes = &left_bytes[offset..];

            array.push((key, rid));
        }

        Ok((
            BPlusTreeLeafPage {
                header,
                array,
                comparator,
            },
            PAGE_SIZE,
        ))
    }
}

pub struct BPlusTreeInternalPageCodec;

impl BPlusTreeInternalPageCodec {
    pub fn encode(page: &BPlusTreeInternalPage, key_size: usize) -> Vec<u8> {
        let mut bytes = BPlusTreeInternalPageHeaderCodec::encode(&page.header);
        for (key, child_page_id) in page.array.iter() {
            encode_key(&mut bytes, key, key_size);
            bytes.extend(CommonCodec::encode_u32(*child_page_id));
        }
        assert!(
            bytes.len() <= PAGE_SIZE,
            "internal page image overflows a page"
        );
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode(
        bytes: &[u8],
        key_size: usize,
        comparator: KeyComparator,
    ) -> VellumResult<DecodedData<BPlusTreeInternalPage>> {
        let (header, offset) = BPlusTreeInternalPageHeaderCodec::decode(bytes)?;
        if !matches!(header.page_type, BPlusTreePageType::InternalPage) {
            return Err(VellumError::Internal(
                "page type must be an internal page".to_string(),
            ));
        }
        let mut left_bytes = &bytes[offset..];

        let mut array = Vec::with_capacity(header.current_size as usize);
        for _ in 0..header.current_size {
            if left_bytes.len() < key_size {
                return Err(VellumError::Internal(
                    "truncated internal page entry".to_string(),
                ));
            }
            let key = left_bytes[..key_size].to_vec();
            left_bytes = &left_bytes[key_size..];

            let (child_page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
            left_bytes = &left_bytes[offset..];

            array.push((key, child_page_id));
        }

        Ok((
            BPlusTreeInternalPage {
                header,
                array,
                comparator,
            },
            PAGE_SIZE,
        ))
    }
}

struct BPlusTreeLeafPageHeaderCodec;

impl BPlusTreeLeafPageHeaderCodec {
    fn encode(header: &BPlusTreeLeafPageHeader) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend(BPlusTreePageTypeCodec::encode(&header.page_type));
        bytes.extend(CommonCodec::encode_u32(header.lsn));
        bytes.extend(CommonCodec::encode_u32(header.current_size));
        bytes.extend(CommonCodec::encode_u32(header.max_size));
        bytes.extend(CommonCodec::encode_u32(header.parent_page_id));
        bytes.extend(CommonCodec::encode_u32(header.page_id));
        bytes.extend(CommonCodec::encode_u32(header.next_page_id));
        bytes
    }

    fn decode(bytes: &[u8]) -> VellumResult<DecodedData<BPlusTreeLeafPageHeader>> {
        let mut left_bytes = bytes;

        let (page_type, offset) = BPlusTreePageTypeCodec::decode(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let (lsn, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let (current_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let (max_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let (parent_page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let (page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let (next_page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        Ok((
            BPlusTreeLeafPageHeader {
                page_type,
                lsn,
                current_size,
                max_size,
                parent_page_id,
                page_id,
                next_page_id,
            },
            bytes.len() - left_bytes.len(),
        ))
    }
}

struct BPlusTreeInternalPageHeaderCodec;

impl BPlusTreeInternalPageHeaderCodec {
    fn encode(header: &BPlusTreeInternalPageHeader) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend(BPlusTreePageTypeCodec::encode(&header.page_type));
        bytes.extend(CommonCodec::encode_u32(header.lsn));
        bytes.extend(CommonCodec::encode_u32(header.current_size));
        bytes.extend(CommonCodec::encode_u32(header.max_size));
        bytes.extend(CommonCodec::encode_u32(header.parent_page_id));
        bytes.extend(CommonCodec::encode_u32(header.page_id));
        bytes
    }

    fn decode(bytes: &[u8]) -> VellumResult<DecodedData<BPlusTreeInternalPageHeader>> {
        let mut left_bytes = bytes;

        let (page_type, offset) = BPlusTreePageTypeCodec::decode(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let (lsn, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let (current_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let (max_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let (parent_page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let (page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        Ok((
            BPlusTreeInternalPageHeader {
                page_type,
                lsn,
                current_size,
                max_size,
                parent_page_id,
                page_id,
            },
            bytes.len() - left_bytes.len(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::INVALID_PAGE_ID;
    use crate::storage::index::comparator::default_comparator;
    use crate::storage::page::RecordId;

    const KEY_SIZE: usize = 4;

    fn key(i: u32) -> Vec<u8> {
        i.to_be_bytes().to_vec()
    }

    #[test]
    fn leaf_page_codec_round_trip() {
        let mut leaf = BPlusTreeLeafPage::new(7, 3, 10, default_comparator);
        leaf.header.next_page_id = 9;
        leaf.insert(&key(1), RecordId::new(1, 1));
        leaf.insert(&key(2), RecordId::new(2, 2));

        let encoded = BPlusTreeLeafPageCodec::encode(&leaf, KEY_SIZE);
        assert_eq!(encoded.len(), PAGE_SIZE);
        // fixed header prefix: type, lsn, size, max_size, parent, page, next
        assert_eq!(&encoded[0..4], &1u32.to_be_bytes());
        assert_eq!(&encoded[8..12], &2u32.to_be_bytes());
        assert_eq!(&encoded[12..16], &10u32.to_be_bytes());
        assert_eq!(&encoded[16..20], &3u32.to_be_bytes());
        assert_eq!(&encoded[20..24], &7u32.to_be_bytes());
        assert_eq!(&encoded[24..28], &9u32.to_be_bytes());

        let (decoded, _) =
            BPlusTreeLeafPageCodec::decode(&encoded, KEY_SIZE, default_comparator).unwrap();
        assert_eq!(decoded.header, leaf.header);
        assert_eq!(decoded.array, leaf.array);
    }

    #[test]
    fn internal_page_codec_round_trip() {
        let mut internal = BPlusTreeInternalPage::new(5, INVALID_PAGE_ID, 10, default_comparator);
        internal.push_back((Vec::new(), 2));
        internal.insert(key(4), 3);
        internal.insert(key(8), 4);

        let encoded = BPlusTreeInternalPageCodec::encode(&internal, KEY_SIZE);
        assert_eq!(encoded.len(), PAGE_SIZE);
        assert_eq!(&encoded[0..4], &2u32.to_be_bytes());

        let (decoded, _) =
            BPlusTreeInternalPageCodec::decode(&encoded, KEY_SIZE, default_comparator).unwrap();
        assert_eq!(decoded.header, internal.header);
        // the dummy key of entry 0 round-trips as zeroes
        assert_eq!(decoded.array[0], (vec![0u8; KEY_SIZE], 2));
        assert_eq!(decoded.array[1..], internal.array[1..]);
    }

    #[test]
    fn dispatch_by_page_type() {
        let leaf = BPlusTreeLeafPage::new(1, INVALID_PAGE_ID, 4, default_comparator);
        let encoded = BPlusTreePageCodec::encode(&BPlusTreePage::Leaf(leaf), KEY_SIZE);
        let (decoded, _) =
            BPlusTreePageCodec::decode(&encoded, KEY_SIZE, default_comparator).unwrap();
        assert!(decoded.is_leaf());

        let mut garbage = encoded;
        garbage[3] = 9;
        assert!(BPlusTreePageCodec::decode(&garbage, KEY_SIZE, default_comparator).is_err());
    }
}
