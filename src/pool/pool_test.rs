use super::*;

#[test]
fn test_pool_grows_to_bound() {
    let mut pool: Pool<u32> = Pool::new("test", 3);

    let a = pool.get(10).unwrap();
    let b = pool.get(20).unwrap();
    let c = pool.get(30).unwrap();
    assert_eq!(pool.in_use_count(), 3);
    assert_eq!(pool.get(40), None, "pool must refuse past its bound");

    assert_eq!(pool.put(b), Some(20));
    assert_eq!(pool.in_use_count(), 2);

    let d = pool.get(40).unwrap();
    assert_eq!(d, b, "freed slot should be reused");
    assert_eq!(pool.get_ref(a), Some(&10));
    assert_eq!(pool.get_ref(c), Some(&30));
    assert_eq!(pool.get_ref(d), Some(&40));
}

#[test]
fn test_pool_put_is_idempotent() {
    let mut pool: Pool<&str> = Pool::new("test", 2);
    let idx = pool.get("x").unwrap();
    assert_eq!(pool.put(idx), Some("x"));
    assert_eq!(pool.put(idx), None);
    assert_eq!(pool.put(999), None);
}

#[test]
fn test_iter_in_use() {
    let mut pool: Pool<u32> = Pool::new("test", 8);
    let indexes: Vec<_> = (0..5).map(|i| pool.get(i * 100).unwrap()).collect();
    pool.put(indexes[1]);
    pool.put(indexes[3]);

    let live: Vec<_> = pool.iter_in_use().map(|(_, v)| *v).collect();
    assert_eq!(live, vec![0, 200, 400]);
    assert_eq!(pool.in_use_indexes(), vec![indexes[0], indexes[2], indexes[4]]);
}

#[test]
fn test_get_mut() {
    let mut pool: Pool<Vec<u8>> = Pool::new("test", 1);
    let idx = pool.get(vec![1]).unwrap();
    pool.get_mut(idx).unwrap().push(2);
    assert_eq!(pool.get_ref(idx), Some(&vec![1, 2]));
}
