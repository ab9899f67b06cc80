//! Rule parameter codec
//!
//! Each rule kind stores its parameters as an opaque blob laid out with the
//! Solidity ABI word encoding (`abi.encode`), so documents compiled off-chain
//! and rules installed through a contract share one format. Decoding is strict:
//! wrong lengths, bad offsets and dirty padding are errors, never defaults.

use crate::errors::{PolicyGuardError, Result};
use crate::rules::{OnChainRule, RuleType};
use alloy_primitives::{Address, U256};

/// ABI word size
pub const WORD: usize = 32;

/// Upper bound on entries in a target or selector list
pub const MAX_LIST_ENTRIES: usize = 256;

/// Parameters for `AllowTargets` / `DenyTargets`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TargetListParams {
    pub targets: Vec<Address>,
}

/// Parameters for `AllowSelectors` / `DenySelectors`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SelectorListParams {
    pub selectors: Vec<[u8; 4]>,
}

/// Parameters for `MaxValue`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxValueParams {
    pub max_value: U256,
}

/// Parameters for `SpendLimit`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpendLimitParams {
    /// Token contract, or [`NATIVE_TOKEN`](crate::rules::NATIVE_TOKEN) for ETH
    pub token: Address,
    pub max_amount: U256,
    pub window_seconds: u64,
}

/// Parameters for `Cooldown`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownParams {
    pub cooldown_seconds: u64,
}

impl TargetListParams {
    pub fn new(targets: Vec<Address>) -> Self {
        Self { targets }
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_list(self.targets.iter().map(|a| address_word(*a)))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let words = decode_list(data, "address[]")?;
        let targets = words
            .map(|w| word_to_address(w, "address[]"))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { targets })
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.targets.contains(addr)
    }
}

impl SelectorListParams {
    pub fn new(selectors: Vec<[u8; 4]>) -> Self {
        Self { selectors }
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_list(self.selectors.iter().map(|s| {
            let mut word = [0u8; WORD];
            word[..4].copy_from_slice(s);
            word
        }))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let words = decode_list(data, "bytes4[]")?;
        let selectors = words
            .map(|w| {
                if w[4..].iter().any(|b| *b != 0) {
                    return Err(malformed("bytes4[]", "selector padding is not zero"));
                }
                let mut selector = [0u8; 4];
                selector.copy_from_slice(&w[..4]);
                Ok(selector)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { selectors })
    }

    pub fn contains(&self, selector: &[u8; 4]) -> bool {
        self.selectors.contains(selector)
    }
}

impl MaxValueParams {
    pub fn new(max_value: U256) -> Self {
        Self { max_value }
    }

    pub fn encode(&self) -> Vec<u8> {
        u256_word(self.max_value).to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let words = exact_words(data, 1, "uint256")?;
        Ok(Self {
            max_value: U256::from_be_slice(words[0]),
        })
    }
}

impl SpendLimitParams {
    pub fn new(token: Address, max_amount: U256, window_seconds: u64) -> Self {
        Self {
            token,
            max_amount,
            window_seconds,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 * WORD);
        out.extend_from_slice(&address_word(self.token));
        out.extend_from_slice(&u256_word(self.max_amount));
        out.extend_from_slice(&u256_word(U256::from(self.window_seconds)));
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        const KIND: &str = "(address,uint256,uint256)";
        let words = exact_words(data, 3, KIND)?;
        Ok(Self {
            token: word_to_address(words[0], KIND)?,
            max_amount: U256::from_be_slice(words[1]),
            window_seconds: word_to_u64(words[2], KIND)?,
        })
    }
}

impl CooldownParams {
    pub fn new(cooldown_seconds: u64) -> Self {
        Self { cooldown_seconds }
    }

    pub fn encode(&self) -> Vec<u8> {
        u256_word(U256::from(self.cooldown_seconds)).to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let words = exact_words(data, 1, "uint256")?;
        Ok(Self {
            cooldown_seconds: word_to_u64(words[0], "uint256")?,
        })
    }
}

/// Typed parameters of any known rule kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleParams {
    AllowTargets(TargetListParams),
    DenyTargets(TargetListParams),
    AllowSelectors(SelectorListParams),
    DenySelectors(SelectorListParams),
    MaxValue(MaxValueParams),
    SpendLimit(SpendLimitParams),
    Cooldown(CooldownParams),
}

impl RuleParams {
    pub fn rule_type(&self) -> RuleType {
        match self {
            RuleParams::AllowTargets(_) => RuleType::AllowTargets,
            RuleParams::DenyTargets(_) => RuleType::DenyTargets,
            RuleParams::AllowSelectors(_) => RuleType::AllowSelectors,
            RuleParams::DenySelectors(_) => RuleType::DenySelectors,
            RuleParams::MaxValue(_) => RuleType::MaxValue,
            RuleParams::SpendLimit(_) => RuleType::SpendLimit,
            RuleParams::Cooldown(_) => RuleType::Cooldown,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            RuleParams::AllowTargets(p) | RuleParams::DenyTargets(p) => p.encode(),
            RuleParams::AllowSelectors(p) | RuleParams::DenySelectors(p) => p.encode(),
            RuleParams::MaxValue(p) => p.encode(),
            RuleParams::SpendLimit(p) => p.encode(),
            RuleParams::Cooldown(p) => p.encode(),
        }
    }

    pub fn decode(rule_type: RuleType, data: &[u8]) -> Result<Self> {
        Ok(match rule_type {
            RuleType::AllowTargets => RuleParams::AllowTargets(TargetListParams::decode(data)?),
            RuleType::DenyTargets => RuleParams::DenyTargets(TargetListParams::decode(data)?),
            RuleType::AllowSelectors => {
                RuleParams::AllowSelectors(SelectorListParams::decode(data)?)
            }
            RuleType::DenySelectors => {
                RuleParams::DenySelectors(SelectorListParams::decode(data)?)
            }
            RuleType::MaxValue => RuleParams::MaxValue(MaxValueParams::decode(data)?),
            RuleType::SpendLimit => RuleParams::SpendLimit(SpendLimitParams::decode(data)?),
            RuleType::Cooldown => RuleParams::Cooldown(CooldownParams::decode(data)?),
        })
    }

    /// Build the stored form of this rule
    pub fn into_rule(self, enabled: bool) -> OnChainRule {
        OnChainRule {
            rule_type: self.rule_type().tag(),
            params: self.encode(),
            enabled,
        }
    }
}

fn malformed(kind: &str, detail: &str) -> PolicyGuardError {
    PolicyGuardError::MalformedInput(format!("{}: {}", kind, detail))
}

fn address_word(addr: Address) -> [u8; WORD] {
    addr.into_word().0
}

fn u256_word(value: U256) -> [u8; WORD] {
    value.to_be_bytes::<WORD>()
}

fn word_to_address(word: &[u8], kind: &str) -> Result<Address> {
    if word[..12].iter().any(|b| *b != 0) {
        return Err(malformed(kind, "address padding is not zero"));
    }
    Ok(Address::from_slice(&word[12..]))
}

fn word_to_u64(word: &[u8], kind: &str) -> Result<u64> {
    u64::try_from(U256::from_be_slice(word)).map_err(|_| malformed(kind, "value exceeds u64"))
}

fn word_to_usize(word: &[u8], kind: &str) -> Result<usize> {
    let value = word_to_u64(word, kind)?;
    usize::try_from(value).map_err(|_| malformed(kind, "value exceeds usize"))
}

fn exact_words<'a>(data: &'a [u8], count: usize, kind: &str) -> Result<Vec<&'a [u8]>> {
    if data.len() != count * WORD {
        return Err(malformed(
            kind,
            &format!("expected {} bytes, got {}", count * WORD, data.len()),
        ));
    }
    Ok(data.chunks_exact(WORD).collect())
}

fn encode_list(items: impl ExactSizeIterator<Item = [u8; WORD]>) -> Vec<u8> {
    let mut out = Vec::with_capacity((2 + items.len()) * WORD);
    out.extend_from_slice(&u256_word(U256::from(WORD)));
    out.extend_from_slice(&u256_word(U256::from(items.len())));
    for item in items {
        out.extend_from_slice(&item);
    }
    out
}

/// Validate the head/length of a dynamic array and return its element words
fn decode_list<'a>(data: &'a [u8], kind: &str) -> Result<std::slice::ChunksExact<'a, u8>> {
    if data.len() < 2 * WORD || data.len() % WORD != 0 {
        return Err(malformed(kind, &format!("invalid length {}", data.len())));
    }

    let offset = word_to_usize(&data[..WORD], kind)?;
    if offset != WORD {
        return Err(malformed(kind, &format!("unexpected offset {}", offset)));
    }

    let len = word_to_usize(&data[WORD..2 * WORD], kind)?;
    if len > MAX_LIST_ENTRIES {
        return Err(malformed(
            kind,
            &format!("{} entries exceeds maximum of {}", len, MAX_LIST_ENTRIES),
        ));
    }

    let body = &data[2 * WORD..];
    if body.len() != len * WORD {
        return Err(malformed(
            kind,
            &format!("declared {} entries, found {} bytes", len, body.len()),
        ));
    }

    Ok(body.chunks_exact(WORD))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    #[test]
    fn test_target_list_roundtrip() {
        let params = TargetListParams::new(vec![addr(0x11), addr(0x22)]);
        let encoded = params.encode();
        assert_eq!(encoded.len(), 4 * WORD);
        assert_eq!(TargetListParams::decode(&encoded).unwrap(), params);
    }

    #[test]
    fn test_target_list_matches_abi_layout() {
        let encoded = TargetListParams::new(vec![addr(0xab)]).encode();
        // offset 0x20, length 1, left-padded address
        assert_eq!(encoded[31], 0x20);
        assert_eq!(encoded[63], 1);
        assert!(encoded[64..76].iter().all(|b| *b == 0));
        assert!(encoded[76..96].iter().all(|b| *b == 0xab));
    }

    #[test]
    fn test_empty_lists_roundtrip() {
        let targets = TargetListParams::default();
        assert_eq!(TargetListParams::decode(&targets.encode()).unwrap(), targets);

        let selectors = SelectorListParams::default();
        assert_eq!(
            SelectorListParams::decode(&selectors.encode()).unwrap(),
            selectors
        );
    }

    #[test]
    fn test_max_length_lists() {
        let targets: Vec<Address> = (0..MAX_LIST_ENTRIES)
            .map(|i| Address::left_padding_from(&(i as u64).to_be_bytes()))
            .collect();
        let params = TargetListParams::new(targets.clone());
        assert_eq!(TargetListParams::decode(&params.encode()).unwrap(), params);

        let mut too_many = targets;
        too_many.push(addr(0xff));
        let encoded = TargetListParams::new(too_many).encode();
        assert!(matches!(
            TargetListParams::decode(&encoded),
            Err(PolicyGuardError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_max_length_selector_lists() {
        let selectors: Vec<[u8; 4]> = (0..MAX_LIST_ENTRIES as u32)
            .map(|i| i.to_be_bytes())
            .collect();
        let params = SelectorListParams::new(selectors.clone());
        assert_eq!(SelectorListParams::decode(&params.encode()).unwrap(), params);

        let mut too_many = selectors;
        too_many.push([0xff; 4]);
        let encoded = SelectorListParams::new(too_many).encode();
        assert!(matches!(
            SelectorListParams::decode(&encoded),
            Err(PolicyGuardError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_selector_roundtrip_and_padding() {
        let params = SelectorListParams::new(vec![[0xa9, 0x05, 0x9c, 0xbb], [0, 0, 0, 0]]);
        let mut encoded = params.encode();
        assert_eq!(SelectorListParams::decode(&encoded).unwrap(), params);

        // dirty low-order bytes in the first selector word
        encoded[2 * WORD + 10] = 1;
        assert!(SelectorListParams::decode(&encoded).is_err());
    }

    #[test]
    fn test_scalar_params_roundtrip() {
        let max = MaxValueParams::new(U256::ZERO);
        assert_eq!(MaxValueParams::decode(&max.encode()).unwrap(), max);

        let max = MaxValueParams::new(U256::MAX);
        assert_eq!(MaxValueParams::decode(&max.encode()).unwrap(), max);

        let spend = SpendLimitParams::new(addr(0x33), U256::from(1_000u64), 86_400);
        assert_eq!(SpendLimitParams::decode(&spend.encode()).unwrap(), spend);

        let spend = SpendLimitParams::new(Address::ZERO, U256::ZERO, 0);
        assert_eq!(SpendLimitParams::decode(&spend.encode()).unwrap(), spend);

        let cooldown = CooldownParams::new(u64::MAX);
        assert_eq!(CooldownParams::decode(&cooldown.encode()).unwrap(), cooldown);
    }

    #[test]
    fn test_rule_params_roundtrip_all_kinds() {
        let all = vec![
            RuleParams::AllowTargets(TargetListParams::new(vec![addr(1)])),
            RuleParams::DenyTargets(TargetListParams::default()),
            RuleParams::AllowSelectors(SelectorListParams::new(vec![[1, 2, 3, 4]])),
            RuleParams::DenySelectors(SelectorListParams::default()),
            RuleParams::MaxValue(MaxValueParams::new(U256::from(7u64))),
            RuleParams::SpendLimit(SpendLimitParams::new(addr(2), U256::from(9u64), 60)),
            RuleParams::Cooldown(CooldownParams::new(30)),
        ];

        for params in all {
            let decoded = RuleParams::decode(params.rule_type(), &params.encode()).unwrap();
            assert_eq!(decoded, params);
        }
    }

    #[test]
    fn test_truncated_input_is_error() {
        let encoded = SpendLimitParams::new(addr(2), U256::from(9u64), 60).encode();
        assert!(SpendLimitParams::decode(&encoded[..64]).is_err());
        assert!(MaxValueParams::decode(&[]).is_err());
        assert!(TargetListParams::decode(&[0u8; 31]).is_err());

        let list = TargetListParams::new(vec![addr(1), addr(2)]).encode();
        assert!(TargetListParams::decode(&list[..list.len() - WORD]).is_err());
    }

    #[test]
    fn test_bad_offset_and_padding() {
        let mut list = TargetListParams::new(vec![addr(1)]).encode();
        list[31] = 0x40;
        assert!(TargetListParams::decode(&list).is_err());

        let mut spend = SpendLimitParams::new(addr(2), U256::from(9u64), 60).encode();
        spend[0] = 1;
        assert!(SpendLimitParams::decode(&spend).is_err());
    }

    #[test]
    fn test_duration_out_of_range() {
        let encoded = U256::from(u64::MAX).saturating_add(U256::from(1u64)).to_be_bytes::<32>();
        assert!(CooldownParams::decode(&encoded).is_err());
    }
}
