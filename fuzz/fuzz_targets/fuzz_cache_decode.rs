#![no_main]

use libfuzzer_sys::fuzz_target;
use nc_cache::MetaCache;
use nc_cache_backend::{StoredValue, decode};
use nc_types::{CacheDelDirection, CacheGetType, CacheScope};
use serde_json::Value;

const GET_TYPES: [CacheGetType; 3] = [
    CacheGetType::Scalar,
    CacheGetType::Array,
    CacheGetType::Object,
];

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data).into_owned();
    let members = text.split('\n').map(str::to_owned).collect();
    for get_type in GET_TYPES {
        let _ = decode(&StoredValue::Text(text.clone()), get_type);
        let _ = decode(&StoredValue::Set(members.clone()), get_type);
    }

    let Ok(value) = serde_json::from_str::<Value>(&text) else {
        return;
    };
    let cache = MetaCache::in_memory();
    cache.set("filterExp:fi1", &value);
    cache.set("filterExp:vw1:list", &value);
    for get_type in GET_TYPES {
        let _ = cache.get("filterExp:fi1", get_type);
    }
    if let Value::Object(object) = &value {
        cache.update("filterExp:fi1", object);
    }
    let _ = cache.get_list(CacheScope::FilterExp, &["vw1"]);
    let _ = cache.export();
    cache.deep_del(CacheScope::FilterExp, "filterExp:fi1", CacheDelDirection::ChildToParent);
    cache.deep_del(CacheScope::FilterExp, "filterExp:vw1:list", CacheDelDirection::ParentToChild);
});
